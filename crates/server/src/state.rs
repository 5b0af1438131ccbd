//! Session lifecycle states and the transition guard.

use thiserror::Error;

/// Session lifecycle state.
///
/// ```text
/// Initializing ──► Running ◄──► Resetting
///        └────────────┴────────────┴──► ShuttingDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// The host is uploading the initial canvas.
    Initializing,
    Running,
    /// An operator is uploading a replacement snapshot.
    Resetting,
    ShuttingDown,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Resetting => "resetting",
            Self::ShuttingDown => "shutting-down",
        }
    }
}

/// A transition the state machine does not allow. Always a caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal session state change from {} to {}", from.as_str(), to.as_str())]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Check whether `from → to` is a legal transition.
pub fn check_transition(from: SessionState, to: SessionState) -> Result<(), IllegalTransition> {
    use SessionState::*;

    let legal = match to {
        Initializing => false,
        Running => matches!(from, Initializing | Resetting),
        Resetting => from == Running,
        ShuttingDown => from != ShuttingDown,
    };

    if legal {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// Progress of the autoreset request protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoResetState {
    /// Threshold not crossed yet (or re-armed by a reset).
    #[default]
    NotSent,
    /// Query sent to operators, waiting for the first volunteer.
    Queried,
    /// A volunteer was picked.
    Requested,
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_legal_transitions() {
        assert!(check_transition(Initializing, Running).is_ok());
        assert!(check_transition(Running, Resetting).is_ok());
        assert!(check_transition(Resetting, Running).is_ok());
        for from in [Initializing, Running, Resetting] {
            assert!(check_transition(from, ShuttingDown).is_ok());
        }
    }

    #[test]
    fn test_illegal_transitions() {
        for from in [Initializing, Running, Resetting, ShuttingDown] {
            assert!(check_transition(from, Initializing).is_err());
        }
        assert!(check_transition(Running, Running).is_err());
        assert!(check_transition(ShuttingDown, Running).is_err());
        assert!(check_transition(Initializing, Resetting).is_err());
        assert!(check_transition(Resetting, Resetting).is_err());
        assert!(check_transition(ShuttingDown, ShuttingDown).is_err());

        let err = check_transition(ShuttingDown, Running).unwrap_err();
        assert_eq!(err.from, ShuttingDown);
        assert_eq!(err.to, Running);
        assert_eq!(
            err.to_string(),
            "illegal session state change from shutting-down to running"
        );
    }
}
