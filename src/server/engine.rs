//! The accepting side: listener loop, admission and orderly stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::schema::ServerConfig;
use crate::net::connection::Connection;
use crate::net::endpoint::Endpoint;
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::ServerTls;
use crate::observability::metrics;
use crate::protocol::digest::Role;
use crate::protocol::handshake::Responder;
use crate::security::blacklist::Blacklist;
use crate::server::registry::Registry;
use crate::session::{AcceptOptions, Event, Notifier, Session, SessionError};

/// Errors surfaced by [`ServerEngine`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

type SessionTasks = JoinSet<Result<(), SessionError>>;

struct Running {
    stop: CancellationToken,
    accept_task: JoinHandle<SessionTasks>,
    local_addr: SocketAddr,
}

struct ServerInner {
    config: ServerConfig,
    accept: AcceptOptions,
    blacklist: ArcSwap<Blacklist>,
    registry: Arc<Registry>,
    notifier: Notifier,
    running: Mutex<Option<Running>>,
}

/// Accepts connections and drives one [`Session`] per admitted peer.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct ServerEngine {
    inner: Arc<ServerInner>,
}

impl ServerEngine {
    /// `tls` turns on the upgrade after every successful handshake.
    pub fn new(config: ServerConfig, tls: Option<ServerTls>, blacklist: Blacklist) -> Self {
        let accept = AcceptOptions {
            responder: Responder::new(config.handshake_timeout(), config.ignore_handshake),
            tls,
        };
        let notifier = Notifier::new(config.event_capacity);

        Self {
            inner: Arc::new(ServerInner {
                config,
                accept,
                blacklist: ArcSwap::from_pointee(blacklist),
                registry: Arc::new(Registry::new()),
                notifier,
                running: Mutex::new(None),
            }),
        }
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = Listener::bind(&self.inner.config.bind_address, self.inner.config.max_connections).await?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;
        let stop = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(self.inner.clone(), listener, stop.clone()));

        tracing::info!(
            address = %local_addr,
            tls = self.inner.accept.tls.is_some(),
            ignore_handshake = self.inner.config.ignore_handshake,
            "Server started"
        );
        self.inner.notifier.emit(Event::ListenerReady { local_addr });

        *running = Some(Running {
            stop,
            accept_task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Stop accepting, notify and close every live session, and wait for
    /// session tasks up to the drain timeout. Calling it again, or before
    /// `start`, does nothing.
    ///
    /// Each session task sends its own notice when the stop token fires, so
    /// one peer that stopped reading delays only its own task.
    pub async fn stop(&self) {
        let mut running = self.inner.running.lock().await;
        let Some(Running {
            stop,
            accept_task,
            local_addr,
        }) = running.take()
        else {
            return;
        };

        tracing::info!(address = %local_addr, "Server stopping");
        stop.cancel();

        let mut sessions = match accept_task.await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!(error = %e, "Accept loop ended abnormally");
                JoinSet::new()
            }
        };
        tracing::debug!(
            tasks = sessions.len(),
            live = self.inner.registry.len(),
            "Waiting for sessions to close"
        );

        let drain_timeout = self.inner.config.drain_timeout();
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(done) = sessions.join_next().await {
                reap(done);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = sessions.len(),
                timeout = ?drain_timeout,
                "Session tasks did not drain in time, aborting"
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        // Aborted tasks never finalized their sessions.
        for session in self.inner.registry.snapshot() {
            tracing::debug!(connection_id = %session.id(), "Closing session left after drain");
            session.abandon().await;
        }

        tracing::info!(address = %local_addr, "Server stopped");
        self.inner.notifier.emit(Event::ListenerEnded { local_addr });
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// The bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Replace the blacklist. Applies to connections accepted afterwards.
    pub fn update_blacklist(&self, blacklist: Blacklist) {
        tracing::info!(entries = blacklist.len(), "Blacklist updated");
        self.inner.blacklist.store(Arc::new(blacklist));
    }

    pub fn blacklist(&self) -> Arc<Blacklist> {
        self.inner.blacklist.load_full()
    }

    /// Sessions that passed the handshake and are still open.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.notifier.subscribe()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: Listener, stop: CancellationToken) -> SessionTasks {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            Some(done) = sessions.join_next(), if !sessions.is_empty() => reap(done),
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => inner.admit(&listener, stream, addr, &stop, &mut sessions),
                Err(e) => {
                    tracing::error!(error = %e, "Accept error");
                    inner.notifier.emit(Event::ConnectionException {
                        session: None,
                        error: e.to_string(),
                    });
                }
            },
        }
    }

    tracing::debug!(pending = sessions.len(), "Accept loop ended");
    sessions
}

impl ServerInner {
    fn admit(
        &self,
        listener: &Listener,
        stream: TcpStream,
        addr: SocketAddr,
        stop: &CancellationToken,
        sessions: &mut SessionTasks,
    ) {
        let remote = Endpoint::from(addr);
        metrics::record_connection_accepted();
        self.notifier.emit(Event::ConnectionAccepted { remote });

        if self.blacklist.load().contains(remote.ip()) {
            metrics::record_connection_rejected("blacklist");
            tracing::info!(remote = %remote, "Rejected blacklisted peer");
            self.notifier.emit(Event::UnauthorizedRejected { remote });
            return;
        }

        let Some(permit) = listener.try_permit() else {
            metrics::record_connection_rejected("capacity");
            tracing::warn!(
                remote = %remote,
                max_connections = listener.max_connections(),
                "Rejected peer, at capacity"
            );
            self.notifier.emit(Event::CapacityRejected { remote });
            return;
        };

        let conn = match Connection::from_stream(stream, self.config.max_line_bytes) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "Discarding socket");
                self.notifier.emit(Event::ConnectionException {
                    session: None,
                    error: e.to_string(),
                });
                return;
            }
        };

        let session = Arc::new(Session::new(conn, Role::Responder, self.notifier.clone()).with_registry(self.registry.clone()));
        let task = SessionTask {
            opts: self.accept.clone(),
            registry: self.registry.clone(),
            notice: self.config.shutdown_notice.clone(),
            notice_timeout: self.config.notice_timeout(),
            stop: stop.clone(),
        };

        sessions.spawn(async move {
            let _permit = permit;
            task.drive(session).await
        });
    }
}

/// Everything one session task needs besides the session itself.
struct SessionTask {
    opts: AcceptOptions,
    registry: Arc<Registry>,
    notice: String,
    notice_timeout: Duration,
    stop: CancellationToken,
}

impl SessionTask {
    /// Handshake, then receive until the session ends or the server stops.
    ///
    /// The stop token is checked first at every step, so a session that
    /// finishes its handshake after stop began is still shut down here.
    async fn drive(self, session: Arc<Session>) -> Result<(), SessionError> {
        let accepted = tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            accepted = session.accept(&self.opts) => Some(accepted),
        };
        match accepted {
            Some(Ok(())) => {}
            Some(Err(e)) => return Err(e),
            None => {
                self.interrupt(&session).await;
                return Ok(());
            }
        }

        tokio::select! {
            biased;
            _ = self.stop.cancelled() => {
                self.interrupt(&session).await;
                Ok(())
            }
            ran = session.run() => ran,
        }
    }

    /// Registered sessions get the notice; the rest are dropped quietly.
    async fn interrupt(&self, session: &Arc<Session>) {
        if self.registry.contains(session.id()) {
            session.shutdown(&self.notice, self.notice_timeout).await;
        } else {
            session.abandon().await;
        }
    }
}

fn reap(done: Result<Result<(), SessionError>, JoinError>) {
    match done {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_fault() => tracing::warn!(error = %e, "Session ended with fault"),
        Ok(Err(e)) => tracing::debug!(error = %e, "Session ended"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!(error = %e, "Session task panicked"),
    }
}
