//! The session lifecycle state machine (spec.md §4.4): `Open -> Initializing
//! -> InitGate -> Handshaking -> Running -> Closed`, with `Failed` reachable
//! from anywhere. Grounded in the teacher's `SessionState::transition`
//! validate-before-mutate pattern.

use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Constructed, no extensions registered yet besides the init gate.
    Open,
    /// Transport handshake started; extension names have been advertised.
    Initializing { since: Instant },
    /// All extensions' `onInit` ran; waiting on the init veto gate.
    InitGate { since: Instant },
    /// Init gate passed; extensions are running their `onHandshake` hooks.
    Handshaking { since: Instant },
    /// Steady state: frames are demultiplexed to extensions.
    Running { since: Instant },
    /// Torn down, deliberately or by the peer.
    Closed,
    /// Torn down due to an unrecoverable error.
    Failed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionStateError {
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl SessionState {
    fn label(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Initializing { .. } => "initializing",
            SessionState::InitGate { .. } => "init_gate",
            SessionState::Handshaking { .. } => "handshaking",
            SessionState::Running { .. } => "running",
            SessionState::Closed => "closed",
            SessionState::Failed(_) => "failed",
        }
    }

    /// Validates and performs a transition, returning the new state.
    ///
    /// `Closed` and `Failed` are absorbing: once there, no further
    /// transition is accepted except re-affirming the same terminal state
    /// (harmless, e.g. a second `close()` call racing the read loop).
    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let allowed = matches!(
            (&self, &next),
            (Open, Initializing { .. })
                | (Initializing { .. }, InitGate { .. })
                | (InitGate { .. }, Handshaking { .. })
                | (Handshaking { .. }, Running { .. })
                | (_, Closed)
                | (_, Failed(_))
                | (Closed, Closed)
                | (Failed(_), Failed(_))
        );
        if allowed {
            Ok(next)
        } else {
            Err(SessionStateError::InvalidTransition {
                from: self.label().to_string(),
                to: next.label().to_string(),
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed(_))
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running { .. })
    }

    /// True once `timeout` has elapsed since entering a non-terminal,
    /// non-running state without reaching `Running`.
    pub fn check_timeout(&self, timeout: Duration, now: Instant) -> bool {
        let since = match self {
            SessionState::Initializing { since }
            | SessionState::InitGate { since }
            | SessionState::Handshaking { since } => *since,
            _ => return false,
        };
        now.duration_since(since) >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        let now = Instant::now();
        let state = SessionState::Open
            .transition(SessionState::Initializing { since: now })
            .unwrap()
            .transition(SessionState::InitGate { since: now })
            .unwrap()
            .transition(SessionState::Handshaking { since: now })
            .unwrap()
            .transition(SessionState::Running { since: now })
            .unwrap();
        assert!(state.is_running());
    }

    #[test]
    fn skipping_a_phase_is_rejected() {
        let now = Instant::now();
        let result = SessionState::Open.transition(SessionState::Handshaking { since: now });
        assert!(result.is_err());
    }

    #[test]
    fn close_is_reachable_from_any_state() {
        let now = Instant::now();
        assert!(SessionState::Open.transition(SessionState::Closed).is_ok());
        assert!(SessionState::Running { since: now }
            .transition(SessionState::Closed)
            .is_ok());
    }

    #[test]
    fn timeout_only_applies_mid_lifecycle() {
        let since = Instant::now() - Duration::from_secs(60);
        let state = SessionState::Handshaking { since };
        assert!(state.check_timeout(Duration::from_secs(5), Instant::now()));
        assert!(!SessionState::Running { since }.check_timeout(Duration::from_secs(5), Instant::now()));
    }
}
