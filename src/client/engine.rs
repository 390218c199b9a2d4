//! The connecting side: one current session, safe reconnects.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use rustls::RootCertStore;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::config::schema::ClientConfig;
use crate::net::connection::{Connection, ConnectionError};
use crate::net::tls::{self, CertificateValidator, ClientTls, PermissiveValidator, StrictValidator, TlsError};
use crate::protocol::digest::Role;
use crate::protocol::handshake::Initiator;
use crate::resilience::backoff::calculate_backoff;
use crate::session::{ConnectOptions, Event, Notifier, Session, SessionError};

/// Errors surfaced by [`ClientEngine`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("connection attempt was cancelled")]
    Cancelled,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<ClientError> },
}

type ReceiveTask = JoinHandle<Result<(), SessionError>>;

struct Current {
    session: Arc<Session>,
    task: Option<ReceiveTask>,
    generation: u64,
}

/// An attempt still connecting or handshaking. `session` is set once the
/// socket is up, so the attempt can be cancelled by closing it.
struct Pending {
    generation: u64,
    session: Option<Arc<Session>>,
}

#[derive(Default)]
struct Slot {
    current: Option<Current>,
    pending: Option<Pending>,
}

struct ClientInner {
    config: ClientConfig,
    options: ConnectOptions,
    notifier: Notifier,
    slot: Mutex<Slot>,
    generation: AtomicU64,
}

/// Holds at most one live session to the configured server.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct ClientEngine {
    inner: Arc<ClientInner>,
}

impl ClientEngine {
    /// `tls` turns on the upgrade after the handshake.
    pub fn new(config: ClientConfig, tls: Option<ClientTls>) -> Self {
        let options = ConnectOptions {
            initiator: Initiator::new(config.handshake_timeout()),
            tls,
        };

        Self {
            inner: Arc::new(ClientInner {
                config,
                options,
                notifier: Notifier::default(),
                slot: Mutex::new(Slot::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Build TLS settings from `config` as well: trust anchors from
    /// `ca_path` and strict validation unless `accept_invalid_certs`.
    pub fn from_config(config: ClientConfig) -> Result<Self, ClientError> {
        let tls = if config.tls_enabled {
            let roots = match &config.ca_path {
                Some(path) => tls::load_root_store(Path::new(path))?,
                None => RootCertStore::empty(),
            };
            let validator: Arc<dyn CertificateValidator> = if config.accept_invalid_certs {
                tracing::warn!("Server certificate validation disabled");
                Arc::new(PermissiveValidator)
            } else {
                Arc::new(StrictValidator)
            };
            Some(ClientTls::new(config.server_name(), roots, validator)?)
        } else {
            None
        };
        Ok(Self::new(config, tls))
    }

    /// Connect, handshake, optionally upgrade, and start receiving.
    ///
    /// Fails with [`ClientError::AlreadyConnected`] while a session is live
    /// or another attempt is in progress. The engine stays usable while the
    /// attempt runs; [`disconnect`](Self::disconnect) cancels it.
    pub async fn connect(&self) -> Result<Arc<Session>, ClientError> {
        let generation = {
            let mut slot = self.inner.slot.lock().await;
            let live = slot.current.as_ref().is_some_and(|c| !c.session.state().is_terminal());
            if live || slot.pending.is_some() {
                return Err(ClientError::AlreadyConnected);
            }
            let generation = self.inner.next_generation();
            slot.pending = Some(Pending {
                generation,
                session: None,
            });
            generation
        };
        self.establish(generation).await
    }

    /// Close the current session, if any, and connect again. Supersedes an
    /// attempt still in progress.
    ///
    /// The old receive loop may still be winding down; it cannot clear
    /// the new session.
    pub async fn reconnect(&self) -> Result<Arc<Session>, ClientError> {
        let (old, superseded, generation) = {
            let mut slot = self.inner.slot.lock().await;
            let generation = self.inner.next_generation();
            let superseded = slot.pending.replace(Pending {
                generation,
                session: None,
            });
            (slot.current.take(), superseded, generation)
        };

        if let Some(session) = superseded.and_then(|p| p.session) {
            session.close().await;
        }
        if let Some(old) = old {
            tracing::info!(
                connection_id = %old.session.id(),
                generation = old.generation,
                "Reconnecting, closing previous session"
            );
            old.session.close().await;
        }
        self.establish(generation).await
    }

    /// [`connect`](Self::connect) with exponential backoff between attempts.
    pub async fn connect_with_retry(&self) -> Result<Arc<Session>, ClientError> {
        let policy = &self.inner.config.reconnect;
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let delay = calculate_backoff(attempt, policy.base_delay_ms, policy.max_delay_ms);
            if !delay.is_zero() {
                tracing::debug!(attempt, delay = ?delay, "Waiting before next connection attempt");
                tokio::time::sleep(delay).await;
            }
            attempt += 1;

            match self.connect().await {
                Ok(session) => return Ok(session),
                Err(e @ (ClientError::AlreadyConnected | ClientError::Cancelled)) => return Err(e),
                Err(e) if attempt >= attempts => {
                    return Err(ClientError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    })
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts = attempts, error = %e, "Connection attempt failed");
                }
            }
        }
    }

    /// Send one line on the current session.
    pub async fn send(&self, line: &str) -> Result<(), ClientError> {
        let session = self.session().await.ok_or(ClientError::NotConnected)?;
        session.send(line).await?;
        Ok(())
    }

    /// Fire-and-forget [`send`](Self::send). Failures are notified as
    /// connection exceptions.
    pub async fn send_detached(&self, line: impl Into<String>) -> Result<(), ClientError> {
        let session = self.session().await.ok_or(ClientError::NotConnected)?;
        session.send_detached(line);
        Ok(())
    }

    /// Close the current session and wait for its receive loop. Also
    /// cancels an attempt still in progress.
    pub async fn disconnect(&self) {
        let (old, pending) = {
            let mut slot = self.inner.slot.lock().await;
            (slot.current.take(), slot.pending.take())
        };
        if let Some(session) = pending.and_then(|p| p.session) {
            session.close().await;
        }
        let Some(old) = old else {
            return;
        };
        old.session.close().await;
        if let Some(task) = old.task {
            finish(task, old.generation).await;
        }
    }

    /// Wait for the current receive loop to end.
    pub async fn wait(&self) {
        let task = {
            let mut slot = self.inner.slot.lock().await;
            slot.current
                .as_mut()
                .and_then(|c| c.task.take().map(|task| (task, c.generation)))
        };
        if let Some((task, generation)) = task {
            finish(task, generation).await;
        }
    }

    /// The current session, while there is one.
    pub async fn session(&self) -> Option<Arc<Session>> {
        self.inner.slot.lock().await.current.as_ref().map(|c| c.session.clone())
    }

    pub async fn is_connected(&self) -> bool {
        self.session().await.is_some_and(|s| s.is_active())
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.notifier.subscribe()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Run attempt `generation` without holding the slot lock. The result
    /// is installed only if no disconnect or reconnect superseded it.
    async fn establish(&self, generation: u64) -> Result<Arc<Session>, ClientError> {
        let config = &self.inner.config;
        let address = config.address();

        let conn = match Connection::connect(&address, config.connect_timeout(), config.max_line_bytes).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(address = %address, error = %e, "Connect failed");
                self.inner.notifier.emit(Event::ConnectionException {
                    session: None,
                    error: e.to_string(),
                });
                if !self.inner.abandon_pending(generation).await {
                    return Err(ClientError::Cancelled);
                }
                return Err(e.into());
            }
        };

        let session = Arc::new(Session::new(conn, Role::Initiator, self.inner.notifier.clone()));
        let tracked = {
            let mut slot = self.inner.slot.lock().await;
            match slot.pending.as_mut() {
                Some(pending) if pending.generation == generation => {
                    pending.session = Some(session.clone());
                    true
                }
                _ => false,
            }
        };
        if !tracked {
            session.close().await;
            return Err(ClientError::Cancelled);
        }

        if let Err(e) = session.connect(&self.inner.options).await {
            if !self.inner.abandon_pending(generation).await {
                return Err(ClientError::Cancelled);
            }
            return Err(e.into());
        }

        let installed = {
            let mut slot = self.inner.slot.lock().await;
            if slot.pending.as_ref().is_some_and(|p| p.generation == generation) {
                slot.pending = None;
                let task = tokio::spawn(receive(session.clone(), Arc::downgrade(&self.inner), generation));
                slot.current = Some(Current {
                    session: session.clone(),
                    task: Some(task),
                    generation,
                });
                true
            } else {
                false
            }
        };
        if !installed {
            tracing::debug!(connection_id = %session.id(), generation, "Attempt superseded, closing");
            session.close().await;
            return Err(ClientError::Cancelled);
        }

        tracing::info!(address = %address, connection_id = %session.id(), generation, "Connected");
        Ok(session)
    }
}

impl ClientInner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop the pending marker if it still belongs to `generation`.
    /// Returns `false` if the attempt was already superseded.
    async fn abandon_pending(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock().await;
        if slot.pending.as_ref().is_some_and(|p| p.generation == generation) {
            slot.pending = None;
            true
        } else {
            false
        }
    }
}

async fn receive(session: Arc<Session>, inner: Weak<ClientInner>, generation: u64) -> Result<(), SessionError> {
    let result = session.run().await;

    if let Some(inner) = inner.upgrade() {
        let mut slot = inner.slot.lock().await;
        if slot.current.as_ref().is_some_and(|c| c.generation == generation) {
            slot.current = None;
        }
    }
    result
}

async fn finish(task: ReceiveTask, generation: u64) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(generation, error = %e, "Receive loop ended with error"),
        Err(e) => tracing::error!(generation, error = %e, "Receive task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn send_without_session_fails() {
        let engine = ClientEngine::new(ClientConfig::default(), None);
        assert!(matches!(engine.send("x").await, Err(ClientError::NotConnected)));
        assert!(matches!(engine.send_detached("x").await, Err(ClientError::NotConnected)));
        assert!(!engine.is_connected().await);
        engine.disconnect().await;
        engine.wait().await;
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = ClientConfig {
            port,
            connect_timeout_ms: 500,
            ..ClientConfig::default()
        };
        config.reconnect.base_delay_ms = 1;
        config.reconnect.max_delay_ms = 5;
        config.reconnect.max_attempts = 3;

        let engine = ClientEngine::new(config, None);
        let mut events = engine.subscribe();
        let err = tokio::time::timeout(Duration::from_secs(10), engine.connect_with_retry())
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, ClientError::Exhausted { attempts: 3, .. }));
        assert!(matches!(
            events.try_recv().unwrap(),
            Event::ConnectionException { session: None, .. }
        ));
    }

    #[test]
    fn tls_settings_follow_config() {
        let config = ClientConfig {
            tls_enabled: true,
            server_name: Some("localhost".to_string()),
            ..ClientConfig::default()
        };
        assert!(ClientEngine::from_config(config).is_ok());

        let missing_ca = ClientConfig {
            tls_enabled: true,
            ca_path: Some("/nonexistent/ca.pem".to_string()),
            ..ClientConfig::default()
        };
        assert!(matches!(
            ClientEngine::from_config(missing_ca),
            Err(ClientError::Tls(TlsError::Io { .. }))
        ));
    }

    #[tokio::test]
    async fn pending_attempt_does_not_block_the_engine() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let engine = ClientEngine::new(
            ClientConfig {
                port,
                handshake_timeout_ms: None,
                ..ClientConfig::default()
            },
            None,
        );

        let attempt = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.connect().await })
        };
        // Accept but never answer the handshake.
        let (_silent, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let quick = Duration::from_secs(1);
        assert!(!tokio::time::timeout(quick, engine.is_connected()).await.unwrap());
        assert!(tokio::time::timeout(quick, engine.session()).await.unwrap().is_none());
        assert!(matches!(
            tokio::time::timeout(quick, engine.send("x")).await.unwrap(),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            tokio::time::timeout(quick, engine.connect()).await.unwrap(),
            Err(ClientError::AlreadyConnected)
        ));

        tokio::time::timeout(quick, engine.disconnect()).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), attempt).await.unwrap().unwrap();
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert!(engine.session().await.is_none());
    }
}
