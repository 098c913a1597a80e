//! Session identity and lifecycle.
//!
//! A session is the lifetime of one client connection's accumulated
//! resource ownership. Valid transitions:
//!
//! - Idle -> Allocating (first mutation begins)
//! - Idle -> Cleaning (connection ended before any mutation)
//! - Allocating -> Active (mutation landed, session owns resources)
//! - Allocating -> Idle (mutation rolled back, nothing owned)
//! - Active -> Allocating (further mutations)
//! - Active -> Cleaning / Allocating -> Cleaning (connection ended)
//! - Cleaning -> Closed (all owned resources released)
//! - Cleaning -> Active (release failed, retryable)
//!
//! Invalid transitions are rejected by [`SessionState::can_transition_to`].
//! On any validation failure the transition is refused (fail-closed).

use std::fmt;

/// Identifier of one client connection's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Session lifecycle state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Connection accepted, nothing mutated yet.
    #[default]
    Idle,
    /// A mutating operation is landing resources for this session.
    Allocating,
    /// The session owns at least one allocation or hosts entry.
    Active,
    /// Owned resources are being released.
    Cleaning,
    /// All resources released. Terminal.
    Closed,
}

impl SessionState {
    /// Check whether transitioning from `self` to `target` is valid.
    ///
    /// Returns `true` only for explicitly allowed transitions; everything
    /// else is refused.
    pub fn can_transition_to(self, target: SessionState) -> bool {
        matches!(
            (self, target),
            (SessionState::Idle, SessionState::Allocating)
                | (SessionState::Idle, SessionState::Cleaning)
                | (SessionState::Allocating, SessionState::Active)
                | (SessionState::Allocating, SessionState::Idle)
                | (SessionState::Allocating, SessionState::Cleaning)
                | (SessionState::Active, SessionState::Allocating)
                | (SessionState::Active, SessionState::Cleaning)
                | (SessionState::Cleaning, SessionState::Closed)
                | (SessionState::Cleaning, SessionState::Active)
        )
    }

    /// Validate and perform a transition, returning the new state or the
    /// refused pair for the caller's error message.
    pub fn transition_to(self, target: SessionState) -> Result<SessionState, (SessionState, SessionState)> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err((self, target))
        }
    }

    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Allocating => "allocating",
            SessionState::Active => "active",
            SessionState::Cleaning => "cleaning",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}
