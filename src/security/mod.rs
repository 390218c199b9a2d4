//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted socket
//!     → blacklist.rs (peer IP refused?)
//!     → capacity permit (net::listener)
//!     → handshake digest (protocol)
//!     → optional TLS (net::tls)
//! ```
//!
//! # Design Decisions
//! - Admission is decided before any session exists
//! - The handshake filters foreign clients; it is not authentication

pub mod blacklist;

pub use blacklist::{Blacklist, BlacklistError};
