use std::time::Duration;

use thiserror::Error;

use crate::services::{LockError, StoreError};

/// Errors that can end a round without a commit
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("Invalid round configuration: {0}")]
    Configuration(String),

    #[error("Round {round_id}: {available} eligible participants, at least {required} required")]
    InsufficientParticipants {
        round_id: String,
        available: usize,
        required: usize,
        carried_over: Vec<String>,
    },

    #[error(
        "Round {round_id}: constraints infeasible after {relaxation_steps} relaxation steps ({} unmatched)",
        unmatched.len()
    )]
    InfeasibleConstraints {
        round_id: String,
        unmatched: Vec<String>,
        relaxation_steps: u32,
        blocked_pairs: usize,
    },

    #[error("Round {round_id}: persistence failed after {attempts} attempts: {source}")]
    PersistenceFailure {
        round_id: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Round {round_id} exceeded its time budget of {budget:?}")]
    TimeoutExceeded { round_id: String, budget: Duration },

    #[error("Deployment {deployment_id} already has a round in progress")]
    LockUnavailable { deployment_id: String },

    #[error("Round {round_id}: lease expired before commit")]
    LeaseExpired { round_id: String },

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Round {round_id}: failed to load {stage}: {source}")]
    Load {
        round_id: String,
        stage: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Round {round_id} was already committed")]
    AlreadyCommitted { round_id: String },

    #[error("Round {round_id} has index {round_index} but round index {latest} is already committed")]
    OutOfOrder {
        round_id: String,
        round_index: u64,
        latest: u64,
    },

    #[error("Score computation failed: {0}")]
    Scoring(String),
}

impl RoundError {
    /// Whether re-triggering the same round may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RoundError::PersistenceFailure { .. }
                | RoundError::TimeoutExceeded { .. }
                | RoundError::LockUnavailable { .. }
                | RoundError::LeaseExpired { .. }
                | RoundError::Lock(_)
                | RoundError::Load { .. }
        )
    }

    /// Stable machine-readable name, used in logs and the CLI summary
    pub fn kind(&self) -> &'static str {
        match self {
            RoundError::Configuration(_) => "configuration_error",
            RoundError::InsufficientParticipants { .. } => "insufficient_participants",
            RoundError::InfeasibleConstraints { .. } => "infeasible_constraints",
            RoundError::PersistenceFailure { .. } => "persistence_failure",
            RoundError::TimeoutExceeded { .. } => "timeout_exceeded",
            RoundError::LockUnavailable { .. } => "lock_unavailable",
            RoundError::LeaseExpired { .. } => "lease_expired",
            RoundError::Lock(_) => "lock_error",
            RoundError::Load { .. } => "load_failure",
            RoundError::AlreadyCommitted { .. } => "already_committed",
            RoundError::OutOfOrder { .. } => "out_of_order",
            RoundError::Scoring(_) => "scoring_failure",
        }
    }
}

impl From<validator::ValidationErrors> for RoundError {
    fn from(errors: validator::ValidationErrors) -> Self {
        RoundError::Configuration(errors.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RoundError::TimeoutExceeded {
            round_id: "r1".into(),
            budget: Duration::from_secs(1),
        }
        .is_retryable());
        assert!(RoundError::LockUnavailable {
            deployment_id: "d".into()
        }
        .is_retryable());
        assert!(!RoundError::Configuration("bad".into()).is_retryable());
        assert!(!RoundError::AlreadyCommitted {
            round_id: "r1".into()
        }
        .is_retryable());
        assert!(!RoundError::InfeasibleConstraints {
            round_id: "r1".into(),
            unmatched: vec!["a".into()],
            relaxation_steps: 0,
            blocked_pairs: 1,
        }
        .is_retryable());
    }

    #[test]
    fn test_persistence_failure_keeps_source() {
        let err = RoundError::PersistenceFailure {
            round_id: "r7".into(),
            attempts: 3,
            source: StoreError::Unavailable("connection refused".into()),
        };
        assert_eq!(err.kind(), "persistence_failure");
        assert!(err.to_string().contains("connection refused"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
