//! Connection ownership and lifecycle.
//!
//! # Responsibilities
//! - Own exactly one socket through a [`DualModeStream`]
//! - Generate unique connection IDs for tracing and registry keys
//! - Carry the per-connection cancellation handle that unblocks reads
//! - Abort in-flight writes on teardown so a peer that stops reading
//!   cannot hold the write side forever
//! - Make close and dispose idempotent and reject use afterwards

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::net::endpoint::Endpoint;
use crate::net::stream::{DualModeStream, StreamError};

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// How long `close` waits for the write side before aborting pending writes.
pub const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Errors raised by [`Connection`] operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    #[error("connection {0} is disposed")]
    Disposed(ConnectionId),

    #[error("read cancelled")]
    Cancelled,

    #[error("no line within {0:?}")]
    Timeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("failed to resolve socket endpoints: {0}")]
    Endpoint(io::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl ConnectionError {
    /// Whether this is the transport going away rather than a fault.
    pub fn is_expected_teardown(&self) -> bool {
        match self {
            ConnectionError::Closed(_) | ConnectionError::Disposed(_) | ConnectionError::Cancelled => true,
            ConnectionError::Stream(StreamError::Released) => true,
            ConnectionError::Stream(StreamError::Io(e)) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// One socket, its line stream and its lifecycle flags.
pub struct Connection {
    id: ConnectionId,
    local: Endpoint,
    remote: Endpoint,
    stream: DualModeStream,
    cancel: CancellationToken,
    abort_writes: CancellationToken,
    closed: AtomicBool,
    disposed: AtomicBool,
    send_blocked: AtomicBool,
}

impl Connection {
    /// Take ownership of an accepted or connected socket.
    pub fn from_stream(stream: TcpStream, max_line_bytes: usize) -> Result<Self, ConnectionError> {
        let local = stream.local_addr().map_err(ConnectionError::Endpoint)?;
        let remote = stream.peer_addr().map_err(ConnectionError::Endpoint)?;

        Ok(Self {
            id: ConnectionId::new(),
            local: Endpoint::new(local),
            remote: Endpoint::new(remote),
            stream: DualModeStream::new(stream, max_line_bytes),
            cancel: CancellationToken::new(),
            abort_writes: CancellationToken::new(),
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            send_blocked: AtomicBool::new(false),
        })
    }

    /// Connect to `addr` (`host:port`) within `timeout`.
    pub async fn connect(
        addr: &str,
        timeout: Duration,
        max_line_bytes: usize,
    ) -> Result<Self, ConnectionError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ConnectionError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => return Err(ConnectionError::Timeout(timeout)),
        };
        Self::from_stream(stream, max_line_bytes)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    pub fn remote_endpoint(&self) -> Endpoint {
        self.remote
    }

    pub fn is_upgraded(&self) -> bool {
        self.stream.is_upgraded()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Administratively block sends. While set, writes succeed without
    /// putting anything on the wire.
    pub fn set_send_blocked(&self, blocked: bool) {
        self.send_blocked.store(blocked, Ordering::Release);
    }

    pub fn is_send_blocked(&self) -> bool {
        self.send_blocked.load(Ordering::Acquire)
    }

    /// Cancel any pending and future reads on this connection.
    pub fn cancel_reads(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Read one line, or `None` at EOF. Unblocks with
    /// [`ConnectionError::Cancelled`] when the connection is cancelled.
    pub async fn read_line(&self) -> Result<Option<String>, ConnectionError> {
        self.ensure_open()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnectionError::Cancelled),
            line = self.stream.read_line() => Ok(line?),
        }
    }

    /// Race one read against `deadline`; `None` waits indefinitely.
    ///
    /// On expiry the read is cancelled through the connection's own
    /// cancellation handle, so the connection reads nothing further.
    pub async fn read_line_within(
        &self,
        deadline: Option<Duration>,
    ) -> Result<Option<String>, ConnectionError> {
        let Some(deadline) = deadline else {
            return self.read_line().await;
        };

        tokio::select! {
            line = self.read_line() => line,
            _ = tokio::time::sleep(deadline) => {
                self.cancel.cancel();
                Err(ConnectionError::Timeout(deadline))
            }
        }
    }

    /// Wait for one line and report whether it equals `expected`.
    pub async fn wait_for_line(
        &self,
        expected: &str,
        deadline: Option<Duration>,
    ) -> Result<(bool, Option<String>), ConnectionError> {
        let line = self.read_line_within(deadline).await?;
        Ok((line.as_deref() == Some(expected), line))
    }

    /// Write one line. A no-op while sends are blocked.
    ///
    /// A write still pending when the connection is torn down fails with
    /// [`ConnectionError::Closed`].
    pub async fn write_line(&self, line: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        if self.is_send_blocked() {
            tracing::trace!(connection_id = %self.id, "Send blocked, dropping line");
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.abort_writes.cancelled() => Err(ConnectionError::Closed(self.id)),
            written = self.stream.write_line(line) => written.map_err(ConnectionError::from),
        }
    }

    /// Cancel reads and write `notice` while holding the write side, so a
    /// concurrent close cannot shut the transport before the notice is out.
    ///
    /// Gives up after `deadline`, including the wait for a write side held
    /// by a send the peer is not draining. Reads are cancelled either way.
    pub async fn interrupt_with_notice(&self, notice: &str, deadline: Duration) -> Result<(), ConnectionError> {
        if self.is_disposed() {
            return Err(ConnectionError::Disposed(self.id));
        }
        let delivered = tokio::time::timeout(deadline, async {
            tokio::select! {
                biased;
                _ = self.abort_writes.cancelled() => Err(ConnectionError::Closed(self.id)),
                written = async {
                    let mut writer = self.stream.writer().await;
                    self.cancel.cancel();
                    writer.write_line(notice).await
                } => written.map_err(ConnectionError::from),
            }
        })
        .await;
        self.cancel.cancel();
        delivered.map_err(|_| ConnectionError::WriteTimeout(deadline))?
    }

    /// Shut down the transport. Returns `false` if already closed.
    ///
    /// Waits at most [`CLOSE_GRACE`] for the write side, then aborts any
    /// write still pending.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        match tokio::time::timeout(CLOSE_GRACE, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(connection_id = %self.id, error = %e, "Transport shutdown failed"),
            Err(_) => tracing::debug!(connection_id = %self.id, "Write side busy, skipping transport shutdown"),
        }
        self.abort_writes.cancel();
        tracing::trace!(connection_id = %self.id, "Connection closed");
        true
    }

    /// Release the socket. Returns `false` if already disposed.
    pub async fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        self.abort_writes.cancel();
        self.stream.release().await;
        tracing::trace!(connection_id = %self.id, "Connection disposed");
        true
    }

    pub(crate) fn stream(&self) -> &DualModeStream {
        &self.stream
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_disposed() {
            return Err(ConnectionError::Disposed(self.id));
        }
        if self.is_closed() {
            return Err(ConnectionError::Closed(self.id));
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("mode", &self.stream.mode())
            .field("closed", &self.is_closed())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::stream::DEFAULT_MAX_LINE_BYTES;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, accepted) = tokio::join!(
            Connection::connect(&addr, Duration::from_secs(5), DEFAULT_MAX_LINE_BYTES),
            listener.accept()
        );
        let server = Connection::from_stream(accepted.unwrap().0, DEFAULT_MAX_LINE_BYTES).unwrap();
        (client.unwrap(), server)
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn endpoints_are_mirrored() {
        let (client, server) = connected_pair().await;
        assert_eq!(client.local_endpoint(), server.remote_endpoint());
        assert_eq!(client.remote_endpoint(), server.local_endpoint());
        assert_eq!(server.to_string(), server.remote_endpoint().to_string());
    }

    #[tokio::test]
    async fn close_and_dispose_are_idempotent() {
        let (client, server) = connected_pair().await;

        assert!(client.close().await);
        assert!(!client.close().await);
        assert!(client.dispose().await);
        assert!(!client.dispose().await);

        assert!(server.dispose().await);
        assert!(!server.dispose().await);
        assert!(!server.close().await);
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn use_after_close_or_dispose_is_typed() {
        let (client, server) = connected_pair().await;

        client.close().await;
        assert!(matches!(client.write_line("x").await, Err(ConnectionError::Closed(_))));
        assert!(matches!(client.read_line().await, Err(ConnectionError::Closed(_))));

        server.dispose().await;
        assert!(matches!(server.write_line("x").await, Err(ConnectionError::Disposed(_))));
        assert!(matches!(
            server.interrupt_with_notice("bye", Duration::from_secs(1)).await,
            Err(ConnectionError::Disposed(_))
        ));
    }

    #[tokio::test]
    async fn blocked_sends_are_silent_noops() {
        let (client, server) = connected_pair().await;

        client.set_send_blocked(true);
        client.write_line("swallowed").await.unwrap();
        client.set_send_blocked(false);
        client.write_line("delivered").await.unwrap();

        assert_eq!(server.read_line().await.unwrap().as_deref(), Some("delivered"));
    }

    #[tokio::test]
    async fn cancel_unblocks_pending_read() {
        let (_client, server) = connected_pair().await;
        let server = std::sync::Arc::new(server);

        let reader = {
            let server = server.clone();
            tokio::spawn(async move { server.read_line().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.cancel_reads();

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
        assert!(result.unwrap_err().is_expected_teardown());
    }

    #[tokio::test]
    async fn deadline_expiry_cancels_the_connection() {
        let (_client, server) = connected_pair().await;

        let result = server.read_line_within(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(ConnectionError::Timeout(_))));
        assert!(server.is_cancelled());
    }

    #[tokio::test]
    async fn wait_for_line_reports_match() {
        let (client, server) = connected_pair().await;

        client.write_line("expected").await.unwrap();
        client.write_line("other").await.unwrap();

        let (matched, line) = server.wait_for_line("expected", None).await.unwrap();
        assert!(matched);
        assert_eq!(line.as_deref(), Some("expected"));

        let (matched, line) = server.wait_for_line("expected", None).await.unwrap();
        assert!(!matched);
        assert_eq!(line.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn notice_is_written_before_reads_stop() {
        let (client, server) = connected_pair().await;

        server.interrupt_with_notice("SHUTDOWN", Duration::from_secs(1)).await.unwrap();
        assert!(server.is_cancelled());
        assert_eq!(client.read_line().await.unwrap().as_deref(), Some("SHUTDOWN"));
        assert!(matches!(server.read_line().await, Err(ConnectionError::Cancelled)));
    }

    #[tokio::test]
    async fn teardown_unblocks_a_write_the_peer_never_drains() {
        let (_client, server) = connected_pair().await;
        let server = std::sync::Arc::new(server);

        let writer = {
            let server = server.clone();
            tokio::spawn(async move {
                let chunk = "x".repeat(1 << 20);
                loop {
                    if let Err(e) = server.write_line(&chunk).await {
                        return e;
                    }
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!writer.is_finished());

        let notice = tokio::time::timeout(
            Duration::from_secs(3),
            server.interrupt_with_notice("bye", Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert!(matches!(notice, Err(ConnectionError::WriteTimeout(_))));
        assert!(server.is_cancelled());

        assert!(tokio::time::timeout(Duration::from_secs(3), server.close()).await.unwrap());
        let err = tokio::time::timeout(Duration::from_secs(3), writer).await.unwrap().unwrap();
        assert!(matches!(err, ConnectionError::Closed(_)));
        assert!(tokio::time::timeout(Duration::from_secs(3), server.dispose()).await.unwrap());
    }
}
