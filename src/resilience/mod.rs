//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Client connection attempt fails:
//!     → backoff.rs (delay before the next attempt)
//!     → ClientEngine::connect_with_retry tries again, up to max_attempts
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; connect and handshake both have deadlines
//! - Handshake mismatches are not retried by the server; only the client retries
//! - Jitter spreads out reconnect storms

pub mod backoff;
