//! Plaintext handshake exchange.
//!
//! The initiator sends its digest; the responder checks it against its own
//! and echoes the digest back as acknowledgment. A mismatch gets no reply.
//! This rejects scanners and foreign protocols before any TLS work is done.
//! It proves nothing about identity: anyone who knows both endpoints can
//! compute the digest.

use std::time::Duration;

use thiserror::Error;

use crate::net::connection::{Connection, ConnectionError};
use crate::protocol::digest::{HandshakeDigest, Role};

/// How long a responder waits for the initiator's line.
pub const RESPONDER_TIMEOUT: Duration = Duration::from_millis(5000);

/// Errors raised during the handshake exchange.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no handshake line within {0:?}")]
    Timeout(Duration),

    #[error("handshake mismatch, received {received:?}")]
    Mismatch { received: String },

    #[error("peer closed before completing the handshake")]
    PeerClosed,

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl HandshakeError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeError::Timeout(_) => "timeout",
            HandshakeError::Mismatch { .. } => "mismatch",
            HandshakeError::PeerClosed => "peer_closed",
            HandshakeError::Connection(_) => "connection",
        }
    }
}

fn from_read(err: ConnectionError) -> HandshakeError {
    match err {
        ConnectionError::Timeout(deadline) => HandshakeError::Timeout(deadline),
        other => HandshakeError::Connection(other),
    }
}

/// The accepting side of the exchange.
#[derive(Debug, Clone, Copy)]
pub struct Responder {
    timeout: Duration,
    ignore_handshake: bool,
}

impl Responder {
    /// With `ignore_handshake` set, any received line is accepted.
    pub fn new(timeout: Duration, ignore_handshake: bool) -> Self {
        Self {
            timeout,
            ignore_handshake,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn ignores_handshake(&self) -> bool {
        self.ignore_handshake
    }

    /// Wait for the initiator's line. On timeout the connection's reads
    /// are cancelled.
    pub async fn receive(&self, conn: &Connection) -> Result<String, HandshakeError> {
        conn.read_line_within(Some(self.timeout))
            .await
            .map_err(from_read)?
            .ok_or(HandshakeError::PeerClosed)
    }

    /// Check a received line against this side's digest.
    pub fn verify(&self, conn: &Connection, line: &str) -> Result<HandshakeDigest, HandshakeError> {
        let expected = HandshakeDigest::compute(conn.local_endpoint(), conn.remote_endpoint(), Role::Responder);

        if self.ignore_handshake || expected.matches(line) {
            Ok(expected)
        } else {
            Err(HandshakeError::Mismatch {
                received: line.to_string(),
            })
        }
    }

    /// Echo the digest back to the initiator.
    pub async fn acknowledge(&self, conn: &Connection, digest: &HandshakeDigest) -> Result<(), HandshakeError> {
        conn.write_line(&digest.to_hex()).await?;
        Ok(())
    }

    /// Receive, verify and acknowledge in one step.
    pub async fn respond(&self, conn: &Connection) -> Result<HandshakeDigest, HandshakeError> {
        let line = self.receive(conn).await?;
        let digest = self.verify(conn, &line)?;
        self.acknowledge(conn, &digest).await?;
        Ok(digest)
    }
}

impl Default for Responder {
    fn default() -> Self {
        Self::new(RESPONDER_TIMEOUT, false)
    }
}

/// The connecting side of the exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct Initiator {
    timeout: Option<Duration>,
}

impl Initiator {
    /// `None` waits for the acknowledgment indefinitely.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Send the digest and wait for it to be echoed back. The send and the
    /// wait run concurrently.
    pub async fn initiate(&self, conn: &Connection) -> Result<HandshakeDigest, HandshakeError> {
        let digest = HandshakeDigest::compute(conn.local_endpoint(), conn.remote_endpoint(), Role::Initiator);
        let hex = digest.to_hex();

        let send = async { conn.write_line(&hex).await.map_err(HandshakeError::from) };
        let reply = async { conn.read_line_within(self.timeout).await.map_err(from_read) };
        let ((), reply) = tokio::try_join!(send, reply)?;

        match reply {
            Some(line) if line == hex => Ok(digest),
            Some(line) => Err(HandshakeError::Mismatch { received: line }),
            None => Err(HandshakeError::PeerClosed),
        }
    }
}
