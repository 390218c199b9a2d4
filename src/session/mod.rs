//! Session subsystem.
//!
//! # Data Flow
//! ```text
//! Connection (accepted or connected)
//!     → Session::accept / Session::connect (handshake, optional TLS)
//!     → Session::run (receive loop, one line at a time)
//!     → finalize (closed event, registry removal, close + dispose)
//!
//! Every step emits an Event through the Notifier.
//! ```
//!
//! # Design Decisions
//! - State moves forward only; see `SessionState`
//! - Exactly one teardown path, guarded so it runs once
//! - Application sends are refused until the session is Active
//! - Subscriber failures are isolated from the engine and from each other

mod driver;
pub mod events;
pub mod state;

pub use driver::{AcceptOptions, ConnectOptions, Session, SessionError};
pub use events::{CloseReason, Event, Notifier};
pub use state::{InvalidTransition, SessionState};
