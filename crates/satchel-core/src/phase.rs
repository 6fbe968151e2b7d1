// ABOUTME: The per-invocation restore state machine and its legal transitions.
// ABOUTME: Idle -> Validating -> Preparing -> Applying -> Committed, with Rejected and RolledBack exits.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a restore invocation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestorePhase {
    Idle,
    Validating,
    Preparing,
    Applying,
    Committed,
    Rejected,
    RolledBack,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal restore transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RestorePhase,
    pub to: RestorePhase,
}

impl RestorePhase {
    /// True for phases no further transition can leave.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RestorePhase::Committed | RestorePhase::Rejected | RestorePhase::RolledBack
        )
    }

    pub fn can_advance_to(self, next: RestorePhase) -> bool {
        use RestorePhase::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Preparing)
                | (Validating, Rejected)
                | (Preparing, Applying)
                | (Preparing, Rejected)
                | (Applying, Committed)
                | (Applying, RolledBack)
        )
    }

    /// Move to `next`, or report the illegal transition without changing
    /// anything.
    pub fn advance(&mut self, next: RestorePhase) -> Result<(), TransitionError> {
        if !self.can_advance_to(next) {
            return Err(TransitionError { from: *self, to: next });
        }
        tracing::debug!("restore phase {} -> {}", self, next);
        *self = next;
        Ok(())
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestorePhase::Idle => "Idle",
            RestorePhase::Validating => "Validating",
            RestorePhase::Preparing => "Preparing",
            RestorePhase::Applying => "Applying",
            RestorePhase::Committed => "Committed",
            RestorePhase::Rejected => "Rejected",
            RestorePhase::RolledBack => "RolledBack",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_path_is_legal() {
        let mut phase = RestorePhase::Idle;
        for next in [
            RestorePhase::Validating,
            RestorePhase::Preparing,
            RestorePhase::Applying,
            RestorePhase::Committed,
        ] {
            phase.advance(next).unwrap();
        }
        assert!(phase.is_terminal());
    }

    #[test]
    fn rejection_only_before_mutation() {
        assert!(RestorePhase::Validating.can_advance_to(RestorePhase::Rejected));
        assert!(!RestorePhase::Applying.can_advance_to(RestorePhase::Rejected));
    }

    #[test]
    fn rollback_only_from_applying() {
        assert!(RestorePhase::Applying.can_advance_to(RestorePhase::RolledBack));
        assert!(!RestorePhase::Preparing.can_advance_to(RestorePhase::RolledBack));
    }

    #[test]
    fn illegal_transition_leaves_phase_unchanged() {
        let mut phase = RestorePhase::Idle;
        let err = phase.advance(RestorePhase::Applying).unwrap_err();
        assert_eq!(err.from, RestorePhase::Idle);
        assert_eq!(phase, RestorePhase::Idle);
    }

    #[test]
    fn terminal_phases_cannot_move() {
        for terminal in [
            RestorePhase::Committed,
            RestorePhase::Rejected,
            RestorePhase::RolledBack,
        ] {
            let mut phase = terminal;
            assert!(phase.advance(RestorePhase::Idle).is_err());
        }
    }
}
