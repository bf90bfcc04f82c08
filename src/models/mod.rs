// Model exports
pub mod domain;
pub mod requests;
pub mod responses;

pub use domain::{
    MatchHistoryEntry, MatchRecord, MatchStatus, MeetingLength, PairKey, Participant, RoundCommit,
    ScoringWeights,
};
pub use requests::{LeftoverPolicy, RoundConfig, RunRoundRequest, WEIGHT_SUM_TOLERANCE};
pub use responses::{Absorption, GroupNotice, Relaxation, RoundNotice, RoundResult};
