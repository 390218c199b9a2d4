//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted or connected TCP socket
//!     → endpoint.rs (canonical local/remote endpoints)
//!     → connection.rs (ownership, cancellation, close/dispose)
//!     → stream.rs (line reads/writes, plaintext until upgraded)
//!     → tls.rs (one-way upgrade to TLS after the handshake line)
//!
//! Stream modes:
//!     Plain → Upgrading → Tls
//!     any → Released
//! ```
//!
//! # Design Decisions
//! - Read and write sides are locked independently; reads stay sequential
//! - The transport mode is chosen once at upgrade time, never per access
//! - Listener capacity is enforced without suspending the accept loop

pub mod connection;
pub mod endpoint;
pub mod listener;
pub mod stream;
pub mod tls;

pub use connection::{Connection, ConnectionError, ConnectionId};
pub use endpoint::Endpoint;
pub use stream::{DualModeStream, StreamError, StreamMode};
