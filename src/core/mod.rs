// Core algorithm exports
pub mod filters;
pub mod history;
pub mod matcher;
pub mod scoring;
pub mod similarity;

pub use filters::{eligible_snapshot, is_eligible, Snapshot};
pub use history::{BlockedPairs, HistoryTracker};
pub use matcher::{BuildError, MatchBuilder, MatchPlan, PlannedGroup};
pub use scoring::{calculate_compatibility, ScoreMatrix};
pub use similarity::{common_items, jaccard};
