//! Handshake protocol.
//!
//! # Data Flow
//! ```text
//! Initiator                                   Responder
//!     digest(remote ‖ local) ──── line ────▶  read (5000 ms deadline)
//!                                             compare with digest(local ‖ remote)
//!     read, compare          ◀─── echo ─────  on match only
//! ```
//!
//! # Design Decisions
//! - Both sides derive the digest from what they observe; nothing is pre-shared
//! - The deadline is a race against the read, cancelled via the connection token
//! - A server-wide override can accept any line (compatibility mode)

pub mod digest;
pub mod handshake;

pub use digest::{HandshakeDigest, Role};
pub use handshake::{HandshakeError, Initiator, Responder, RESPONDER_TIMEOUT};
