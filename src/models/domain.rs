use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// A candidate for matching, as read from the participant directory
///
/// Immutable for the duration of a round. Profile edits happen between
/// rounds through flows outside this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(rename = "isActive", default = "default_true")]
    pub active: bool,
    #[serde(rename = "isPaused", default)]
    pub paused: bool,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    #[serde(default)]
    pub availability: BTreeSet<String>,
    #[serde(rename = "meetingLength", default)]
    pub meeting_length: MeetingLength,
}

impl Participant {
    /// Build an active participant with no preferences
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            active: true,
            paused: false,
            topics: BTreeSet::new(),
            availability: BTreeSet::new(),
            meeting_length: MeetingLength::default(),
        }
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_availability<I, S>(mut self, slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.availability = slots.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_meeting_length(mut self, length: MeetingLength) -> Self {
        self.meeting_length = length;
        self
    }
}

fn default_true() -> bool {
    true
}

/// Preferred meeting length in minutes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum MeetingLength {
    Fifteen,
    #[default]
    Thirty,
    FortyFive,
    Sixty,
}

impl MeetingLength {
    pub fn minutes(self) -> u16 {
        match self {
            MeetingLength::Fifteen => 15,
            MeetingLength::Thirty => 30,
            MeetingLength::FortyFive => 45,
            MeetingLength::Sixty => 60,
        }
    }
}

impl TryFrom<u16> for MeetingLength {
    type Error = String;

    fn try_from(minutes: u16) -> Result<Self, Self::Error> {
        match minutes {
            15 => Ok(MeetingLength::Fifteen),
            30 => Ok(MeetingLength::Thirty),
            45 => Ok(MeetingLength::FortyFive),
            60 => Ok(MeetingLength::Sixty),
            other => Err(format!(
                "unsupported meeting length {} (expected 15, 30, 45 or 60)",
                other
            )),
        }
    }
}

impl From<MeetingLength> for u16 {
    fn from(length: MeetingLength) -> Self {
        length.minutes()
    }
}

/// Unordered pair of participant ids in canonical (sorted) order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    low: String,
    high: String,
}

impl PairKey {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn low(&self) -> &str {
        &self.low
    }

    pub fn high(&self) -> &str {
        &self.high
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}}}", self.low, self.high)
    }
}

/// Append-only record that two participants met in a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchHistoryEntry {
    #[serde(rename = "pairKey")]
    pub pair_key: PairKey,
    #[serde(rename = "roundId")]
    pub round_id: String,
    #[serde(rename = "roundIndex")]
    pub round_index: u64,
}

/// Lifecycle of a created match. The engine only creates `Scheduled`;
/// later states belong to the flows that run the meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    #[default]
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Scheduled => "scheduled",
            MatchStatus::Confirmed => "confirmed",
            MatchStatus::Completed => "completed",
            MatchStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for MatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(MatchStatus::Scheduled),
            "confirmed" => Ok(MatchStatus::Confirmed),
            "completed" => Ok(MatchStatus::Completed),
            "cancelled" => Ok(MatchStatus::Cancelled),
            other => Err(format!("unknown match status: {}", other)),
        }
    }
}

/// One group produced by a round; created once and never updated here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: Uuid,
    #[serde(rename = "deploymentId")]
    pub deployment_id: String,
    #[serde(rename = "roundId")]
    pub round_id: String,
    #[serde(rename = "roundIndex")]
    pub round_index: u64,
    pub members: Vec<String>,
    #[serde(rename = "averageScore")]
    pub average_score: f64,
    #[serde(rename = "scheduledDate")]
    pub scheduled_date: DateTime<Utc>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub status: MatchStatus,
}

impl MatchRecord {
    pub fn scheduled(
        deployment_id: &str,
        round_id: &str,
        round_index: u64,
        members: Vec<String>,
        average_score: f64,
        scheduled_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            deployment_id: deployment_id.to_string(),
            round_id: round_id.to_string(),
            round_index,
            members,
            average_score,
            scheduled_date,
            created_at: Utc::now(),
            status: MatchStatus::Scheduled,
        }
    }
}

/// Everything a round writes, committed as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundCommit {
    pub round_id: String,
    pub round_index: u64,
    pub records: Vec<MatchRecord>,
    pub history: Vec<MatchHistoryEntry>,
}

/// Relative weights of the three compatibility signals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub topic: f64,
    pub availability: f64,
    pub length: f64,
}

impl ScoringWeights {
    pub fn sum(&self) -> f64 {
        self.topic + self.availability + self.length
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            topic: 0.40,
            availability: 0.40,
            length: 0.20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_canonical() {
        let a = PairKey::new("bob", "alice");
        let b = PairKey::new("alice", "bob");
        assert_eq!(a, b);
        assert_eq!(a.low(), "alice");
        assert_eq!(a.high(), "bob");
        assert_eq!(a.to_string(), "{alice, bob}");
    }

    #[test]
    fn test_meeting_length_rejects_unknown_minutes() {
        assert_eq!(MeetingLength::try_from(45), Ok(MeetingLength::FortyFive));
        assert!(MeetingLength::try_from(20).is_err());

        let parsed: Result<Participant, _> =
            serde_json::from_str(r#"{"id": "p1", "meetingLength": 25}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_participant_defaults() {
        let parsed: Participant = serde_json::from_str(r#"{"id": "p1"}"#).unwrap();
        assert!(parsed.active);
        assert!(!parsed.paused);
        assert_eq!(parsed.meeting_length, MeetingLength::Thirty);
        assert!(parsed.topics.is_empty());
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            MatchStatus::Scheduled,
            MatchStatus::Confirmed,
            MatchStatus::Completed,
            MatchStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<MatchStatus>(), Ok(status));
        }
        assert!("pending".parse::<MatchStatus>().is_err());
    }
}
