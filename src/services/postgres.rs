use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::models::{MatchHistoryEntry, MatchStatus, MeetingLength, PairKey, Participant, RoundCommit};
use crate::services::traits::{window_start, HistoryStore, MatchSink, ParticipantSource, StoreError};

/// Match status as stored in the `match_status` enum column
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "match_status", rename_all = "lowercase")]
pub enum StatusColumn {
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
}

impl From<MatchStatus> for StatusColumn {
    fn from(value: MatchStatus) -> Self {
        match value {
            MatchStatus::Scheduled => StatusColumn::Scheduled,
            MatchStatus::Confirmed => StatusColumn::Confirmed,
            MatchStatus::Completed => StatusColumn::Completed,
            MatchStatus::Cancelled => StatusColumn::Cancelled,
        }
    }
}

/// PostgreSQL backing for the participant directory and round storage
///
/// A round commit writes the round marker, its match records and the pair
/// history in one transaction, so a round is either fully visible or absent.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run the embedded migrations
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(idle_timeout)
            .test_before_acquire(true)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn from_settings(
        url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
        acquire_timeout_secs: Option<u64>,
        idle_timeout_secs: Option<u64>,
    ) -> Result<Self, StoreError> {
        tracing::info!("Connecting to PostgreSQL");

        Self::new(
            url,
            max_connections.unwrap_or(10),
            min_connections.unwrap_or(1),
            Duration::from_secs(acquire_timeout_secs.unwrap_or(5)),
            Duration::from_secs(idle_timeout_secs.unwrap_or(600)),
        )
        .await
    }
}

fn to_db_index(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::InvalidData(format!("round index {} out of range", value)))
}

fn from_db_index(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::InvalidData(format!("negative round index {}", value)))
}

fn participant_from_row(row: &PgRow) -> Result<Participant, StoreError> {
    let minutes: i16 = row.try_get("meeting_length")?;
    let meeting_length = u16::try_from(minutes)
        .map_err(|_| StoreError::InvalidData(format!("negative meeting length {}", minutes)))
        .and_then(|m| MeetingLength::try_from(m).map_err(StoreError::InvalidData))?;

    let topics: Vec<String> = row.try_get("topics")?;
    let availability: Vec<String> = row.try_get("availability")?;

    Ok(Participant {
        id: row.try_get("id")?,
        active: row.try_get("is_active")?,
        paused: row.try_get("is_paused")?,
        topics: topics.into_iter().collect(),
        availability: availability.into_iter().collect(),
        meeting_length,
    })
}

#[async_trait]
impl ParticipantSource for PostgresStore {
    async fn list_active_participants(&self, deployment_id: &str) -> Result<Vec<Participant>, StoreError> {
        let query = r#"
            SELECT id, is_active, is_paused, topics, availability, meeting_length
            FROM participants
            WHERE deployment_id = $1 AND is_active = TRUE
            ORDER BY id
        "#;

        let rows = sqlx::query(query).bind(deployment_id).fetch_all(&self.pool).await?;
        let participants = rows.iter().map(participant_from_row).collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            "Loaded {} active participants for deployment {}",
            participants.len(),
            deployment_id
        );

        Ok(participants)
    }
}

#[async_trait]
impl HistoryStore for PostgresStore {
    async fn query_recent_pairs(
        &self,
        deployment_id: &str,
        round_index: u64,
        window: u64,
    ) -> Result<Vec<MatchHistoryEntry>, StoreError> {
        if window == 0 {
            return Ok(Vec::new());
        }

        let query = r#"
            SELECT participant_low, participant_high, round_id, round_index
            FROM match_history
            WHERE deployment_id = $1 AND round_index >= $2
        "#;

        let rows = sqlx::query(query)
            .bind(deployment_id)
            .bind(to_db_index(window_start(round_index, window))?)
            .fetch_all(&self.pool)
            .await?;

        let entries = rows
            .iter()
            .map(|row| -> Result<MatchHistoryEntry, StoreError> {
                let low: String = row.try_get("participant_low")?;
                let high: String = row.try_get("participant_high")?;
                Ok(MatchHistoryEntry {
                    pair_key: PairKey::new(low, high),
                    round_id: row.try_get("round_id")?,
                    round_index: from_db_index(row.try_get("round_index")?)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            "Loaded {} history entries for deployment {} (round {}, window {})",
            entries.len(),
            deployment_id,
            round_index,
            window
        );

        Ok(entries)
    }

    async fn latest_round_index(&self, deployment_id: &str) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT MAX(round_index) AS latest FROM rounds WHERE deployment_id = $1")
            .bind(deployment_id)
            .fetch_one(&self.pool)
            .await?;

        let latest: Option<i64> = row.try_get("latest")?;
        latest.map(from_db_index).transpose()
    }
}

#[async_trait]
impl MatchSink for PostgresStore {
    async fn save_round(&self, deployment_id: &str, commit: &RoundCommit) -> Result<(), StoreError> {
        let round_index = to_db_index(commit.round_index)?;
        let mut tx = self.pool.begin().await?;

        let marker = sqlx::query(
            r#"
            INSERT INTO rounds (deployment_id, round_id, round_index, committed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (deployment_id, round_id) DO NOTHING
            "#,
        )
        .bind(deployment_id)
        .bind(&commit.round_id)
        .bind(round_index)
        .execute(&mut *tx)
        .await?;

        if marker.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::Conflict {
                deployment_id: deployment_id.to_string(),
                round_id: commit.round_id.clone(),
            });
        }

        for record in &commit.records {
            sqlx::query(
                r#"
                INSERT INTO match_records
                    (id, deployment_id, round_id, round_index, members, average_score,
                     scheduled_date, created_at, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(record.id)
            .bind(&record.deployment_id)
            .bind(&record.round_id)
            .bind(to_db_index(record.round_index)?)
            .bind(&record.members)
            .bind(record.average_score)
            .bind(record.scheduled_date)
            .bind(record.created_at)
            .bind(StatusColumn::from(record.status))
            .execute(&mut *tx)
            .await?;
        }

        for entry in &commit.history {
            sqlx::query(
                r#"
                INSERT INTO match_history
                    (deployment_id, participant_low, participant_high, round_id, round_index)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(deployment_id)
            .bind(entry.pair_key.low())
            .bind(entry.pair_key.high())
            .bind(&entry.round_id)
            .bind(to_db_index(entry.round_index)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            "Committed round {} for deployment {}: {} records, {} history entries",
            commit.round_id,
            deployment_id,
            commit.records.len(),
            commit.history.len()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchRecord;

    #[test]
    fn test_status_column_conversion() {
        assert_eq!(StatusColumn::from(MatchStatus::Scheduled), StatusColumn::Scheduled);
        assert_eq!(StatusColumn::from(MatchStatus::Cancelled), StatusColumn::Cancelled);
    }

    #[test]
    fn test_round_index_conversion_bounds() {
        assert_eq!(to_db_index(42).unwrap(), 42);
        assert!(to_db_index(u64::MAX).is_err());
        assert!(from_db_index(-1).is_err());
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL"]
    async fn test_commit_is_idempotent_per_round() {
        let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/coffee_match".into());
        let store = PostgresStore::from_settings(&url, Some(2), Some(1), None, None)
            .await
            .expect("Failed to connect");

        let round_id = format!("test-{}", uuid::Uuid::new_v4());
        let commit = RoundCommit {
            round_id: round_id.clone(),
            round_index: 1,
            records: Vec::new(),
            history: Vec::new(),
        };

        store.save_round("test-deployment", &commit).await.unwrap();
        let second = store.save_round("test-deployment", &commit).await;
        assert!(matches!(second, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL"]
    async fn test_mixed_case_pair_commits_under_any_collation() {
        let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "postgres://localhost/coffee_match".into());
        let store = PostgresStore::from_settings(&url, Some(2), Some(1), None, None)
            .await
            .expect("Failed to connect");

        // Byte order puts "Zed" first; linguistic collations put "alice" first
        let deployment = format!("test-{}", uuid::Uuid::new_v4());
        let pair_key = PairKey::new("alice", "Zed");
        assert_eq!(pair_key.low(), "Zed");

        let members = vec!["Zed".to_string(), "alice".to_string()];
        let commit = RoundCommit {
            round_id: "round-1".to_string(),
            round_index: 1,
            records: vec![MatchRecord::scheduled(&deployment, "round-1", 1, members, 0.5, chrono::Utc::now())],
            history: vec![MatchHistoryEntry {
                pair_key: pair_key.clone(),
                round_id: "round-1".to_string(),
                round_index: 1,
            }],
        };

        store.save_round(&deployment, &commit).await.unwrap();

        let recent = store.query_recent_pairs(&deployment, 2, 1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].pair_key, pair_key);
    }
}
