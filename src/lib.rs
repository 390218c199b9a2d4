//! wirelink: line-oriented TCP sessions with a digest handshake and an
//! optional in-place TLS upgrade.

pub mod client;
pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod resilience;
pub mod security;
pub mod server;
pub mod session;

pub use client::{ClientEngine, ClientError};
pub use config::WirelinkConfig;
pub use lifecycle::Shutdown;
pub use security::Blacklist;
pub use server::{ServerEngine, ServerError};
pub use session::{CloseReason, Event, Session, SessionError, SessionState};
