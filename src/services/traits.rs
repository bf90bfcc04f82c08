use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{MatchHistoryEntry, Participant, RoundCommit, RoundNotice};

/// Errors from the participant directory and the round store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLx error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Round {round_id} already committed for deployment {deployment_id}")]
    Conflict {
        deployment_id: String,
        round_id: String,
    },

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Lock backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Notification endpoint returned status {0}")]
    Rejected(u16),

    #[error("Notifier unavailable: {0}")]
    Unavailable(String),
}

/// Proof of holding a round lock
///
/// The token is unique per acquisition so a holder can never release a lock
/// that expired and was taken by someone else.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub token: String,
    pub acquired_at: Instant,
    pub ttl: Duration,
}

impl Lease {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            acquired_at: Instant::now(),
            ttl,
        }
    }

    /// True while the local clock says the lease has not run out
    pub fn is_within_ttl(&self) -> bool {
        self.acquired_at.elapsed() < self.ttl
    }
}

/// Read access to the participant directory
#[async_trait]
pub trait ParticipantSource: Send + Sync {
    /// Every participant of the deployment; eligibility is filtered later
    async fn list_active_participants(&self, deployment_id: &str) -> Result<Vec<Participant>, StoreError>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// History entries that can block pairs in `round_index`
    ///
    /// Covers every entry with `round_index - window <= entry.round_index`,
    /// including entries at or after `round_index`.
    async fn query_recent_pairs(
        &self,
        deployment_id: &str,
        round_index: u64,
        window: u64,
    ) -> Result<Vec<MatchHistoryEntry>, StoreError>;

    /// Highest committed round index for the deployment
    async fn latest_round_index(&self, deployment_id: &str) -> Result<Option<u64>, StoreError>;
}

#[async_trait]
pub trait MatchSink: Send + Sync {
    /// Persist records, history entries and the round marker atomically
    ///
    /// Returns `StoreError::Conflict` if the round id was already committed.
    async fn save_round(&self, deployment_id: &str, commit: &RoundCommit) -> Result<(), StoreError>;
}

/// Mutual exclusion for rounds of one deployment
#[async_trait]
pub trait RoundLock: Send + Sync {
    /// Take the lock, or `None` if someone else holds it
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, LockError>;

    /// Whether `lease` still owns its key
    async fn is_held(&self, lease: &Lease) -> Result<bool, LockError>;

    async fn release(&self, lease: &Lease) -> Result<(), LockError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &RoundNotice) -> Result<(), NotifyError>;
}

/// Lower bound of the history window for `round_index`
pub fn window_start(round_index: u64, window: u64) -> u64 {
    round_index.saturating_sub(window)
}
