//! Coffee Match - round-based matching engine for virtual coffee meetings
//!
//! Each round takes the active participants of a deployment, scores every
//! pair, and partitions them into small groups while avoiding pairs that met
//! recently. Results are committed atomically and handed to a notifier.

pub mod config;
pub mod core;
pub mod error;
pub mod models;
pub mod rounds;
pub mod services;

// Re-export commonly used types
pub use crate::core::{calculate_compatibility, HistoryTracker, MatchBuilder, MatchPlan, ScoreMatrix};
pub use error::RoundError;
pub use models::{
    LeftoverPolicy, MatchHistoryEntry, MatchRecord, Participant, RoundConfig, RoundResult, ScoringWeights,
};
pub use rounds::{OrchestratorOptions, RoundOrchestrator};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let a = Participant::new("a").with_topics(["rust"]);
        let b = Participant::new("b").with_topics(["rust"]);
        let score = calculate_compatibility(&a, &b, &ScoringWeights::default());
        assert!((score - 0.6).abs() < 1e-12);
    }
}
