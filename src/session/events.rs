//! Lifecycle notifications.
//!
//! Every notification point goes through one [`Notifier`], a broadcast
//! channel. Each subscriber owns its receiver, so a subscriber that is
//! slow, panics or goes away never affects the engine or the other
//! subscribers. A subscriber that falls more than the channel capacity
//! behind loses the oldest events and sees `RecvError::Lagged`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::net::endpoint::Endpoint;
use crate::net::tls::SessionSecurity;
use crate::session::Session;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the stream or the transport went away.
    RemoteClosed,
    /// Reads were cancelled.
    Cancelled,
    /// Closed by the local application.
    LocalClose,
    /// Closed by a server stop.
    ServerShutdown,
    HandshakeFailed,
    HandshakeTimeout,
    TlsFailed,
    /// The receive loop hit an unexpected fault.
    Faulted(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::RemoteClosed => f.write_str("remote closed"),
            CloseReason::Cancelled => f.write_str("cancelled"),
            CloseReason::LocalClose => f.write_str("closed locally"),
            CloseReason::ServerShutdown => f.write_str("server shutdown"),
            CloseReason::HandshakeFailed => f.write_str("handshake failed"),
            CloseReason::HandshakeTimeout => f.write_str("handshake timed out"),
            CloseReason::TlsFailed => f.write_str("TLS upgrade failed"),
            CloseReason::Faulted(err) => write!(f, "faulted: {}", err),
        }
    }
}

/// A lifecycle notification.
#[derive(Debug, Clone)]
pub enum Event {
    ListenerReady { local_addr: SocketAddr },
    ListenerEnded { local_addr: SocketAddr },
    ConnectionAccepted { remote: Endpoint },
    UnauthorizedRejected { remote: Endpoint },
    CapacityRejected { remote: Endpoint },
    HandshakeBegun { session: Arc<Session> },
    HandshakeReceived { session: Arc<Session>, line: String },
    HandshakeCompleted { session: Arc<Session> },
    HandshakeFailed { session: Arc<Session>, reason: String },
    HandshakeTimeout { session: Arc<Session> },
    TlsReady { session: Arc<Session>, security: SessionSecurity },
    TlsFailed { session: Arc<Session>, reason: String },
    ConnectionReady { session: Arc<Session> },
    DataReceived { session: Arc<Session>, payload: String },
    DataSent { session: Arc<Session>, payload: String },
    ConnectionClosed { session: Arc<Session>, reason: CloseReason },
    ConnectionException { session: Option<Arc<Session>>, error: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ListenerReady { .. } => "listener_ready",
            Event::ListenerEnded { .. } => "listener_ended",
            Event::ConnectionAccepted { .. } => "connection_accepted",
            Event::UnauthorizedRejected { .. } => "unauthorized_rejected",
            Event::CapacityRejected { .. } => "capacity_rejected",
            Event::HandshakeBegun { .. } => "handshake_begun",
            Event::HandshakeReceived { .. } => "handshake_received",
            Event::HandshakeCompleted { .. } => "handshake_completed",
            Event::HandshakeFailed { .. } => "handshake_failed",
            Event::HandshakeTimeout { .. } => "handshake_timeout",
            Event::TlsReady { .. } => "tls_ready",
            Event::TlsFailed { .. } => "tls_failed",
            Event::ConnectionReady { .. } => "connection_ready",
            Event::DataReceived { .. } => "data_received",
            Event::DataSent { .. } => "data_sent",
            Event::ConnectionClosed { .. } => "connection_closed",
            Event::ConnectionException { .. } => "connection_exception",
        }
    }

    /// The session this event is about, if any.
    pub fn session(&self) -> Option<&Arc<Session>> {
        match self {
            Event::HandshakeBegun { session }
            | Event::HandshakeReceived { session, .. }
            | Event::HandshakeCompleted { session }
            | Event::HandshakeFailed { session, .. }
            | Event::HandshakeTimeout { session }
            | Event::TlsReady { session, .. }
            | Event::TlsFailed { session, .. }
            | Event::ConnectionReady { session }
            | Event::DataReceived { session, .. }
            | Event::DataSent { session, .. }
            | Event::ConnectionClosed { session, .. } => Some(session),
            Event::ConnectionException { session, .. } => session.as_ref(),
            Event::ListenerReady { .. }
            | Event::ListenerEnded { .. }
            | Event::ConnectionAccepted { .. }
            | Event::UnauthorizedRejected { .. }
            | Event::CapacityRejected { .. } => None,
        }
    }
}

/// Fan-out point for [`Event`]s.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Event>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Deliver to every current subscriber. Never blocks, never fails.
    pub fn emit(&self, event: Event) {
        tracing::trace!(
            event = event.name(),
            subscribers = self.tx.receiver_count(),
            "Emitting event"
        );
        let _ = self.tx.send(event);
    }

    /// Run `handler` for every event on its own task. A panic ends only
    /// that task.
    pub fn spawn_subscriber<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
