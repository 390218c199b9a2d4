//! Session lifecycle states.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

/// Where a session is in its lifecycle.
///
/// ```text
/// Connecting → HandshakePending → Upgrading → Active → Closed
///                    │                │
///                    ▼                ▼
///             HandshakeFailed   UpgradeFailed → Closed
/// ```
///
/// `HandshakePending` may go straight to `Active` when TLS is off, and any
/// state may move to `Closed`. Nothing moves backwards.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting = 0,
    HandshakePending = 1,
    HandshakeFailed = 2,
    Upgrading = 3,
    UpgradeFailed = 4,
    Active = 5,
    Closed = 6,
}

impl From<u8> for SessionState {
    fn from(val: u8) -> Self {
        match val {
            0 => SessionState::Connecting,
            1 => SessionState::HandshakePending,
            2 => SessionState::HandshakeFailed,
            3 => SessionState::Upgrading,
            4 => SessionState::UpgradeFailed,
            5 => SessionState::Active,
            _ => SessionState::Closed,
        }
    }
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, HandshakePending)
                | (HandshakePending, HandshakeFailed | Upgrading | Active)
                | (Upgrading, UpgradeFailed | Active)
                | (Connecting | HandshakePending | HandshakeFailed | Upgrading | UpgradeFailed | Active, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::HandshakePending => "handshake-pending",
            SessionState::HandshakeFailed => "handshake-failed",
            SessionState::Upgrading => "upgrading",
            SessionState::UpgradeFailed => "upgrade-failed",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Atomically updated [`SessionState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(initial: SessionState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`, returning the state it replaced.
    pub fn transition(&self, next: SessionState) -> Result<SessionState, InvalidTransition> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = SessionState::from(current);
            if !from.can_transition_to(next) {
                return Err(InvalidTransition { from, to: next });
            }
            match self
                .0
                .compare_exchange(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn happy_paths() {
        let plain = StateCell::new(Connecting);
        plain.transition(HandshakePending).unwrap();
        plain.transition(Active).unwrap();
        assert_eq!(plain.transition(Closed).unwrap(), Active);

        let tls = StateCell::new(Connecting);
        tls.transition(HandshakePending).unwrap();
        tls.transition(Upgrading).unwrap();
        tls.transition(Active).unwrap();
        assert_eq!(tls.get(), Active);
    }

    #[test]
    fn failures_only_lead_to_closed() {
        let cell = StateCell::new(Connecting);
        cell.transition(HandshakePending).unwrap();
        cell.transition(HandshakeFailed).unwrap();
        assert!(cell.transition(Upgrading).is_err());
        assert!(cell.transition(Active).is_err());
        cell.transition(Closed).unwrap();

        assert!(!UpgradeFailed.can_transition_to(Active));
        assert!(UpgradeFailed.can_transition_to(Closed));
    }

    #[test]
    fn never_moves_backwards() {
        let cell = StateCell::new(Connecting);
        cell.transition(HandshakePending).unwrap();
        cell.transition(Active).unwrap();

        let err = cell.transition(HandshakePending).unwrap_err();
        assert_eq!(err, InvalidTransition { from: Active, to: HandshakePending });

        cell.transition(Closed).unwrap();
        assert!(cell.transition(Closed).is_err());
        assert!(Closed.is_terminal());
    }
}
