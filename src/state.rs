//! Verification state machine
//!
//! The transition table is kept as data so every edge is explicit and
//! testable. Each edge is tagged with the source allowed to drive it.

use crate::error::{KycError, Result};
use crate::types::VerificationStatus::{self, *};

/// Who is driving a status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionSource {
    /// Provider webhook result
    Provider,
    /// Expiry sweep
    Scheduler,
    /// Admin override
    Manual,
}

/// Whether `from → to` is a legal change for `source`
///
/// Same-status pairs are not transitions and always return false; callers
/// treat them as refreshes.
pub fn can_transition(from: VerificationStatus, to: VerificationStatus, source: TransitionSource) -> bool {
    if from == to {
        return false;
    }
    match source {
        TransitionSource::Manual => matches!(to, Approved | Rejected),
        TransitionSource::Scheduler => from == Approved && to == Expired,
        TransitionSource::Provider => matches!(
            (from, to),
            (Pending, Approved | Rejected | UnderReview | RequiresAction)
                | (UnderReview, Approved | Rejected)
                | (RequiresAction, Pending | UnderReview | Approved | Rejected)
        ),
    }
}

/// Outcome of evaluating a requested status against the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A real transition that carries audit and event side effects
    Transition,
    /// Already at the requested status; refresh fields only
    Refresh,
}

/// Classify a requested change, rejecting edges the table does not allow
pub fn step(from: VerificationStatus, to: VerificationStatus, source: TransitionSource) -> Result<Step> {
    if from == to {
        return Ok(Step::Refresh);
    }
    if can_transition(from, to, source) {
        Ok(Step::Transition)
    } else {
        Err(KycError::Validation(format!(
            "Illegal transition {} -> {} ({:?})",
            from, to, source
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [VerificationStatus; 6] =
        [Pending, UnderReview, Approved, Rejected, Expired, RequiresAction];

    #[test]
    fn test_provider_edges_from_pending() {
        for to in [Approved, Rejected, UnderReview, RequiresAction] {
            assert!(can_transition(Pending, to, TransitionSource::Provider), "{to}");
        }
        assert!(!can_transition(Pending, Expired, TransitionSource::Provider));
    }

    #[test]
    fn test_under_review_only_resolves() {
        assert!(can_transition(UnderReview, Approved, TransitionSource::Provider));
        assert!(can_transition(UnderReview, Rejected, TransitionSource::Provider));
        assert!(!can_transition(UnderReview, Pending, TransitionSource::Provider));
        assert!(!can_transition(UnderReview, RequiresAction, TransitionSource::Provider));
    }

    #[test]
    fn test_closed_states_accept_nothing_from_provider() {
        for from in [Rejected, Expired, Approved] {
            for to in ALL {
                assert!(!can_transition(from, to, TransitionSource::Provider), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_only_scheduler_expires() {
        assert!(can_transition(Approved, Expired, TransitionSource::Scheduler));
        assert!(!can_transition(Pending, Expired, TransitionSource::Scheduler));
        assert!(!can_transition(Approved, Expired, TransitionSource::Provider));
        assert!(!can_transition(Approved, Expired, TransitionSource::Manual));
    }

    #[test]
    fn test_manual_override_from_any_state() {
        for from in ALL {
            if from != Approved {
                assert!(can_transition(from, Approved, TransitionSource::Manual));
            }
            if from != Rejected {
                assert!(can_transition(from, Rejected, TransitionSource::Manual));
            }
            assert!(!can_transition(from, UnderReview, TransitionSource::Manual));
        }
    }

    #[test]
    fn test_step_classification() {
        assert_eq!(step(Approved, Approved, TransitionSource::Provider).unwrap(), Step::Refresh);
        assert_eq!(step(Pending, Approved, TransitionSource::Provider).unwrap(), Step::Transition);
        let err = step(Expired, Rejected, TransitionSource::Provider).unwrap_err();
        assert!(matches!(err, KycError::Validation(_)));
    }
}
