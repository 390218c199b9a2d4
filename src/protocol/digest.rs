//! Handshake digest derivation.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::net::endpoint::Endpoint;

/// Length of a digest on the wire.
pub const DIGEST_HEX_LEN: usize = 40;

/// Which side of the handshake a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The accepting side.
    Responder,
    /// The connecting side.
    Initiator,
}

/// `SHA1(SHA1(first) ‖ SHA1(second))` over the two endpoint strings.
///
/// The responder hashes local before remote, the initiator remote before
/// local, so both peers arrive at the same value from mirrored views of
/// one connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandshakeDigest([u8; 20]);

impl HandshakeDigest {
    pub fn compute(local: Endpoint, remote: Endpoint, role: Role) -> Self {
        let local_hash = Sha1::digest(local.to_string().as_bytes());
        let remote_hash = Sha1::digest(remote.to_string().as_bytes());

        let (first, second) = match role {
            Role::Responder => (local_hash, remote_hash),
            Role::Initiator => (remote_hash, local_hash),
        };

        let mut hasher = Sha1::new();
        hasher.update(first);
        hasher.update(second);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Upper-case hex, as sent on the wire.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// Exact, case-sensitive comparison against a received line.
    pub fn matches(&self, line: &str) -> bool {
        line == self.to_hex()
    }
}

impl fmt::Display for HandshakeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HandshakeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandshakeDigest({})", self)
    }
}
