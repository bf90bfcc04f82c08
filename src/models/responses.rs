use serde::{Deserialize, Serialize};

use crate::models::domain::MatchRecord;

/// A disallowed pair that was reintroduced to make the round feasible
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relaxation {
    #[serde(rename = "participantA")]
    pub participant_a: String,
    #[serde(rename = "participantB")]
    pub participant_b: String,
    /// Round index of the history entry that blocked the pair
    #[serde(rename = "blockingRoundIndex")]
    pub blocking_round_index: u64,
}

/// A leftover participant placed into an already formed group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Absorption {
    pub participant: String,
    #[serde(rename = "groupIndex")]
    pub group_index: usize,
    pub score: f64,
}

/// Outcome of a successfully committed round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundResult {
    #[serde(rename = "deploymentId")]
    pub deployment_id: String,
    #[serde(rename = "roundId")]
    pub round_id: String,
    #[serde(rename = "roundIndex")]
    pub round_index: u64,
    pub records: Vec<MatchRecord>,
    #[serde(rename = "carriedOver")]
    pub carried_over: Vec<String>,
    pub relaxations: Vec<Relaxation>,
    pub absorptions: Vec<Absorption>,
    #[serde(rename = "eligibleParticipants")]
    pub eligible_participants: usize,
    pub notified: bool,
}

/// Payload handed to the notifier once a round is committed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundNotice {
    #[serde(rename = "deploymentId")]
    pub deployment_id: String,
    #[serde(rename = "roundId")]
    pub round_id: String,
    #[serde(rename = "roundIndex")]
    pub round_index: u64,
    pub groups: Vec<GroupNotice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupNotice {
    #[serde(rename = "matchId")]
    pub match_id: String,
    pub members: Vec<String>,
    #[serde(rename = "averageScore")]
    pub average_score: f64,
    #[serde(rename = "sharedTopics")]
    pub shared_topics: Vec<String>,
    #[serde(rename = "commonAvailability")]
    pub common_availability: Vec<String>,
}
