//! Server subsystem.
//!
//! # Data Flow
//! ```text
//! Listener::accept
//!     → ConnectionAccepted
//!     → blacklist check   (UnauthorizedRejected, socket dropped)
//!     → capacity permit   (CapacityRejected, socket dropped)
//!     → Session::accept   (handshake; registry.rs entry on success)
//!     → Session::run      (one task per session, tracked in a JoinSet)
//!
//! stop():
//!     cancel accept loop → notice to each registered session
//!     → drain session tasks (bounded) → ListenerEnded
//! ```
//!
//! # Design Decisions
//! - The blacklist is swapped atomically; the accept path never locks it
//! - Rejections happen before any session exists
//! - A session slot is held by its task and returned when the task ends

pub mod engine;
pub mod registry;

pub use engine::{ServerEngine, ServerError};
pub use registry::Registry;
