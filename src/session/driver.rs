//! Session: one connection's lifecycle from handshake to teardown.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::net::connection::{Connection, ConnectionError, ConnectionId};
use crate::net::tls::{self, ClientTls, ServerTls, TlsError};
use crate::observability::metrics;
use crate::protocol::digest::Role;
use crate::protocol::handshake::{HandshakeError, Initiator, Responder};
use crate::server::registry::Registry;
use crate::session::events::{CloseReason, Event, Notifier};
use crate::session::state::{InvalidTransition, SessionState, StateCell};

/// Errors surfaced by [`Session`] operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is {0}, not active")]
    NotActive(SessionState),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("TLS upgrade failed: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl SessionError {
    /// Whether this is an unexpected I/O or protocol fault rather than an
    /// ordinary rejection or teardown.
    pub fn is_fault(&self) -> bool {
        matches!(self, SessionError::Connection(e) if !e.is_expected_teardown())
    }
}

/// How the accepting side establishes a session.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    pub responder: Responder,
    pub tls: Option<ServerTls>,
}

/// How the connecting side establishes a session.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub initiator: Initiator,
    pub tls: Option<ClientTls>,
}

/// A connection plus its lifecycle state.
///
/// Sessions are shared as `Arc<Session>`; notifications carry that handle
/// so subscribers can reply on the session they were told about.
pub struct Session {
    conn: Connection,
    role: Role,
    state: StateCell,
    notifier: Notifier,
    registry: Option<Arc<Registry>>,
    shutting_down: AtomicBool,
    finalized: AtomicBool,
}

impl Session {
    /// Take ownership of `conn`. The session starts in `Connecting`.
    pub fn new(conn: Connection, role: Role, notifier: Notifier) -> Self {
        Self {
            conn,
            role,
            state: StateCell::new(SessionState::Connecting),
            notifier,
            registry: None,
            shutting_down: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        }
    }

    /// Register in `registry` once the handshake succeeds, and leave it on
    /// teardown.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Responder side: handshake, optional TLS, then `Active`.
    ///
    /// On failure the session has already been torn down.
    pub async fn accept(self: &Arc<Self>, opts: &AcceptOptions) -> Result<(), SessionError> {
        self.begin_handshake()?;

        let line = match opts.responder.receive(&self.conn).await {
            Ok(line) => line,
            Err(err) => return Err(self.fail_handshake(err).await),
        };
        self.notifier.emit(Event::HandshakeReceived {
            session: self.clone(),
            line: line.clone(),
        });

        let digest = match opts.responder.verify(&self.conn, &line) {
            Ok(digest) => digest,
            Err(err) => return Err(self.fail_handshake(err).await),
        };

        self.register();

        if let Err(err) = opts.responder.acknowledge(&self.conn, &digest).await {
            return Err(self.fail_handshake(err).await);
        }
        self.complete_handshake();

        if let Some(server_tls) = &opts.tls {
            self.state.transition(SessionState::Upgrading)?;
            match tls::upgrade_as_server(&self.conn, server_tls).await {
                Ok(security) => self.notifier.emit(Event::TlsReady {
                    session: self.clone(),
                    security,
                }),
                Err(err) => return Err(self.fail_upgrade(err).await),
            }
        }

        self.activate()
    }

    /// Initiator side: handshake, optional TLS, then `Active`.
    ///
    /// On failure the session has already been torn down.
    pub async fn connect(self: &Arc<Self>, opts: &ConnectOptions) -> Result<(), SessionError> {
        self.begin_handshake()?;

        match opts.initiator.initiate(&self.conn).await {
            Ok(digest) => {
                self.notifier.emit(Event::HandshakeReceived {
                    session: self.clone(),
                    line: digest.to_hex(),
                });
                self.complete_handshake();
            }
            Err(err) => {
                if let HandshakeError::Mismatch { received } = &err {
                    self.notifier.emit(Event::HandshakeReceived {
                        session: self.clone(),
                        line: received.clone(),
                    });
                }
                return Err(self.fail_handshake(err).await);
            }
        }

        if let Some(client_tls) = &opts.tls {
            self.state.transition(SessionState::Upgrading)?;
            match tls::upgrade_as_client(&self.conn, client_tls).await {
                Ok(security) => self.notifier.emit(Event::TlsReady {
                    session: self.clone(),
                    security,
                }),
                Err(err) => return Err(self.fail_upgrade(err).await),
            }
        }

        self.activate()
    }

    /// Receive lines until the peer closes, reads are cancelled, or a fault
    /// occurs. Always finishes by tearing the session down.
    ///
    /// Unexpected faults are notified and then returned.
    pub async fn run(self: &Arc<Self>) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(SessionError::NotActive(state));
        }

        let outcome = loop {
            tracing::trace!(connection_id = %self.id(), "Awaiting line");
            match self.conn.read_line().await {
                Ok(Some(payload)) => {
                    metrics::record_line_received();
                    self.notifier.emit(Event::DataReceived {
                        session: self.clone(),
                        payload,
                    });
                }
                Ok(None) => break Ok(CloseReason::RemoteClosed),
                Err(ConnectionError::Cancelled) => {
                    if self.shutting_down.load(Ordering::Acquire) {
                        break Ok(CloseReason::ServerShutdown);
                    }
                    break Ok(CloseReason::Cancelled);
                }
                Err(err) if err.is_expected_teardown() => {
                    tracing::debug!(connection_id = %self.id(), error = %err, "Transport closed");
                    break Ok(CloseReason::RemoteClosed);
                }
                Err(err) => {
                    tracing::warn!(
                        connection_id = %self.id(),
                        remote = %self.conn.remote_endpoint(),
                        error = %err,
                        "Receive loop fault"
                    );
                    self.notifier.emit(Event::ConnectionException {
                        session: Some(self.clone()),
                        error: err.to_string(),
                    });
                    break Err(err);
                }
            }
        };

        match outcome {
            Ok(reason) => {
                self.finalize(reason).await;
                Ok(())
            }
            Err(err) => {
                self.finalize(CloseReason::Faulted(err.to_string())).await;
                Err(err.into())
            }
        }
    }

    /// Send one application line. Only allowed while `Active`.
    pub async fn send(self: &Arc<Self>, line: &str) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(SessionError::NotActive(state));
        }
        if self.conn.is_send_blocked() {
            return Ok(());
        }

        self.conn.write_line(line).await?;
        metrics::record_line_sent();
        self.notifier.emit(Event::DataSent {
            session: self.clone(),
            payload: line.to_string(),
        });
        Ok(())
    }

    /// Fire-and-forget [`send`](Self::send). Failures are logged and
    /// notified as connection exceptions.
    pub fn send_detached(self: &Arc<Self>, line: impl Into<String>) {
        let session = self.clone();
        let line = line.into();
        tokio::spawn(async move {
            if let Err(err) = session.send(&line).await {
                tracing::warn!(connection_id = %session.id(), error = %err, "Detached send failed");
                session.notifier.emit(Event::ConnectionException {
                    session: Some(session.clone()),
                    error: err.to_string(),
                });
            }
        });
    }

    /// Close locally through the normal teardown path.
    pub async fn close(self: &Arc<Self>) {
        self.finalize(CloseReason::LocalClose).await;
    }

    /// Server stop path: stop reads, deliver `notice` best-effort within
    /// `deadline`, tear down. The notice is sent at most once however often
    /// this is called.
    pub async fn shutdown(self: &Arc<Self>, notice: &str, deadline: Duration) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.conn.interrupt_with_notice(notice, deadline).await {
            tracing::debug!(connection_id = %self.id(), error = %err, "Shutdown notice not delivered");
        }
        self.finalize(CloseReason::ServerShutdown).await;
    }

    /// Server stop path for a session that never became live: tear down
    /// without a notice.
    pub(crate) async fn abandon(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::Release);
        self.finalize(CloseReason::ServerShutdown).await;
    }

    fn begin_handshake(self: &Arc<Self>) -> Result<(), SessionError> {
        self.state.transition(SessionState::HandshakePending)?;
        tracing::debug!(
            connection_id = %self.id(),
            remote = %self.conn.remote_endpoint(),
            role = ?self.role,
            "Handshake begun"
        );
        self.notifier.emit(Event::HandshakeBegun { session: self.clone() });
        Ok(())
    }

    fn complete_handshake(self: &Arc<Self>) {
        tracing::debug!(connection_id = %self.id(), "Handshake completed");
        self.notifier.emit(Event::HandshakeCompleted { session: self.clone() });
    }

    fn register(self: &Arc<Self>) {
        let Some(registry) = &self.registry else {
            return;
        };
        registry.insert(self.clone());
        // A concurrent teardown may have run before the insert.
        if self.finalized.load(Ordering::Acquire) {
            registry.remove(self.id());
        }
    }

    fn activate(self: &Arc<Self>) -> Result<(), SessionError> {
        self.state.transition(SessionState::Active)?;
        metrics::session_activated();
        tracing::info!(
            connection_id = %self.id(),
            remote = %self.conn.remote_endpoint(),
            tls = self.conn.is_upgraded(),
            "Session active"
        );
        self.notifier.emit(Event::ConnectionReady { session: self.clone() });
        Ok(())
    }

    async fn fail_handshake(self: &Arc<Self>, err: HandshakeError) -> SessionError {
        if let Err(invalid) = self.state.transition(SessionState::HandshakeFailed) {
            tracing::debug!(connection_id = %self.id(), error = %invalid, "Handshake failure after teardown");
        }
        metrics::record_handshake_failure(err.kind());
        tracing::info!(
            connection_id = %self.id(),
            remote = %self.conn.remote_endpoint(),
            error = %err,
            "Handshake failed"
        );

        let reason = match &err {
            HandshakeError::Timeout(_) => {
                self.notifier.emit(Event::HandshakeTimeout { session: self.clone() });
                CloseReason::HandshakeTimeout
            }
            _ => {
                self.notifier.emit(Event::HandshakeFailed {
                    session: self.clone(),
                    reason: err.to_string(),
                });
                CloseReason::HandshakeFailed
            }
        };

        self.finalize(reason).await;
        SessionError::Handshake(err)
    }

    async fn fail_upgrade(self: &Arc<Self>, err: TlsError) -> SessionError {
        if let Err(invalid) = self.state.transition(SessionState::UpgradeFailed) {
            tracing::debug!(connection_id = %self.id(), error = %invalid, "Upgrade failure after teardown");
        }
        metrics::record_tls_failure();
        tracing::warn!(
            connection_id = %self.id(),
            remote = %self.conn.remote_endpoint(),
            error = %err,
            "TLS upgrade failed"
        );
        self.notifier.emit(Event::TlsFailed {
            session: self.clone(),
            reason: err.to_string(),
        });

        self.finalize(CloseReason::TlsFailed).await;
        SessionError::Tls(err)
    }

    /// The single teardown path. Runs once; later calls return immediately.
    async fn finalize(self: &Arc<Self>, reason: CloseReason) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Ok(SessionState::Active) = self.state.transition(SessionState::Closed) {
            metrics::session_deactivated();
        }

        tracing::info!(
            connection_id = %self.id(),
            remote = %self.conn.remote_endpoint(),
            reason = %reason,
            "Connection closed"
        );
        self.notifier.emit(Event::ConnectionClosed {
            session: self.clone(),
            reason,
        });

        if let Some(registry) = &self.registry {
            registry.remove(self.id());
        }

        self.conn.close().await;
        self.conn.dispose().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("role", &self.role)
            .field("state", &self.state())
            .field("remote", &self.conn.remote_endpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::stream::DEFAULT_MAX_LINE_BYTES;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::broadcast;

    async fn accepted_session(notifier: &Notifier, registry: &Arc<Registry>) -> (Arc<Session>, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, accepted) = tokio::join!(
            Connection::connect(&addr, Duration::from_secs(5), DEFAULT_MAX_LINE_BYTES),
            listener.accept()
        );
        let conn = Connection::from_stream(accepted.unwrap().0, DEFAULT_MAX_LINE_BYTES).unwrap();
        let session = Session::new(conn, Role::Responder, notifier.clone()).with_registry(registry.clone());
        (Arc::new(session), client.unwrap())
    }

    async fn next_named(rx: &mut broadcast::Receiver<Event>, name: &str) -> Event {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.name() == name {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn send_before_active_is_rejected() {
        let notifier = Notifier::default();
        let registry = Arc::new(Registry::new());
        let (session, _client) = accepted_session(&notifier, &registry).await;

        let err = session.send("early").await.unwrap_err();
        assert!(matches!(err, SessionError::NotActive(SessionState::Connecting)));
        assert!(matches!(session.run().await, Err(SessionError::NotActive(_))));
    }

    #[tokio::test]
    async fn accepted_session_receives_and_finalizes_once() {
        let notifier = Notifier::default();
        let mut events = notifier.subscribe();
        let registry = Arc::new(Registry::new());
        let (session, client) = accepted_session(&notifier, &registry).await;

        let accept_options = AcceptOptions::default();
        let initiator = Initiator::default();
        let (accepted, initiated) = tokio::join!(
            session.accept(&accept_options),
            initiator.initiate(&client)
        );
        accepted.unwrap();
        initiated.unwrap();
        assert!(session.is_active());
        assert!(registry.contains(session.id()));

        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.run().await })
        };

        client.write_line("hello").await.unwrap();
        match next_named(&mut events, "data_received").await {
            Event::DataReceived { payload, .. } => assert_eq!(payload, "hello"),
            other => panic!("unexpected event {other:?}"),
        }

        client.dispose().await;
        runner.await.unwrap().unwrap();
        session.close().await;

        match next_named(&mut events, "connection_closed").await {
            Event::ConnectionClosed { reason, .. } => assert_eq!(reason, CloseReason::RemoteClosed),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty());
        assert!(session.connection().is_disposed());

        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(event) = events.try_recv() {
            assert_ne!(event.name(), "connection_closed", "closed twice");
        }
    }

    #[tokio::test]
    async fn wrong_digest_is_never_registered() {
        let notifier = Notifier::default();
        let registry = Arc::new(Registry::new());
        let (session, client) = accepted_session(&notifier, &registry).await;

        client.write_line("not-a-digest").await.unwrap();
        let err = session.accept(&AcceptOptions::default()).await.unwrap_err();

        assert!(matches!(err, SessionError::Handshake(HandshakeError::Mismatch { .. })));
        assert!(!err.is_fault());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty());
        assert!(client.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_close_ends_the_receive_loop() {
        let notifier = Notifier::default();
        let mut events = notifier.subscribe();
        let registry = Arc::new(Registry::new());
        let (session, client) = accepted_session(&notifier, &registry).await;

        let accept_options = AcceptOptions::default();
        let initiator = Initiator::default();
        let (accepted, _) = tokio::join!(
            session.accept(&accept_options),
            initiator.initiate(&client)
        );
        accepted.unwrap();

        let runner = {
            let session = session.clone();
            tokio::spawn(async move { session.run().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close().await;
        runner.await.unwrap().unwrap();

        match next_named(&mut events, "connection_closed").await {
            Event::ConnectionClosed { reason, .. } => assert_eq!(reason, CloseReason::LocalClose),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(session.send("late").await, Err(SessionError::NotActive(SessionState::Closed))));
    }
}
