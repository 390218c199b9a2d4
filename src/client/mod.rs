//! Client subsystem.
//!
//! # Data Flow
//! ```text
//! connect()
//!     → Connection::connect (TCP, bounded by connect_timeout_ms)
//!     → Session::connect (initiator handshake, optional TLS)
//!     → receive task (Session::run), tagged with a generation
//!     → installed as the current session
//!
//! reconnect():
//!     close current session → connect() → new generation
//! ```
//!
//! # Design Decisions
//! - One current session, guarded by an async mutex
//! - A finished receive task clears the slot only if it still owns it
//! - Retries use exponential backoff with jitter

pub mod engine;

pub use engine::{ClientEngine, ClientError};
