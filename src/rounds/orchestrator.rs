use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

use crate::core::{
    common_items, eligible_snapshot, BuildError, HistoryTracker, MatchBuilder, MatchPlan, ScoreMatrix,
};
use crate::error::RoundError;
use crate::models::{
    GroupNotice, MatchRecord, Participant, RoundCommit, RoundConfig, RoundNotice, RoundResult,
};
use crate::services::{
    HistoryStore, Lease, MatchSink, Notifier, ParticipantSource, RoundLock, StoreError,
};

/// Runtime knobs for a round, independent of the matching parameters
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Wall-clock budget from lease acquisition to commit
    pub round_timeout: Duration,
    pub lease_ttl: Duration,
    pub persistence_max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub persistence_backoff: Duration,
    pub score_workers: usize,
    pub notify_timeout: Duration,
    pub lock_key_prefix: String,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(120),
            lease_ttl: Duration::from_secs(300),
            persistence_max_attempts: 3,
            persistence_backoff: Duration::from_millis(200),
            score_workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            notify_timeout: Duration::from_secs(10),
            lock_key_prefix: "coffee-match:round-lock".to_string(),
        }
    }
}

/// Drives one matching round from lock to notification
///
/// Flow:
/// 1. Validate the round configuration
/// 2. Take the deployment's round lease
/// 3. Load and filter participants, load the history window
/// 4. Score, build groups, derive records and history entries
/// 5. Commit everything in one unit, retrying transient failures
/// 6. Release the lease, then notify
pub struct RoundOrchestrator {
    deployment_id: String,
    participants: Arc<dyn ParticipantSource>,
    history: Arc<dyn HistoryStore>,
    sink: Arc<dyn MatchSink>,
    lock: Arc<dyn RoundLock>,
    notifier: Arc<dyn Notifier>,
    options: OrchestratorOptions,
}

impl RoundOrchestrator {
    pub fn new(
        deployment_id: impl Into<String>,
        participants: Arc<dyn ParticipantSource>,
        history: Arc<dyn HistoryStore>,
        sink: Arc<dyn MatchSink>,
        lock: Arc<dyn RoundLock>,
        notifier: Arc<dyn Notifier>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            participants,
            history,
            sink,
            lock,
            notifier,
            options,
        }
    }

    /// Build from one store that serves participants, history and commits
    pub fn with_store<S>(
        deployment_id: impl Into<String>,
        store: Arc<S>,
        lock: Arc<dyn RoundLock>,
        notifier: Arc<dyn Notifier>,
        options: OrchestratorOptions,
    ) -> Self
    where
        S: ParticipantSource + HistoryStore + MatchSink + 'static,
    {
        Self::new(
            deployment_id,
            store.clone(),
            store.clone(),
            store,
            lock,
            notifier,
            options,
        )
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn lock_key(&self) -> String {
        format!("{}:{}", self.options.lock_key_prefix, self.deployment_id)
    }

    /// Run a round scheduled for now
    pub async fn run_round(
        &self,
        round_id: &str,
        round_index: u64,
        config: &RoundConfig,
    ) -> Result<RoundResult, RoundError> {
        self.run_round_at(round_id, round_index, config, Utc::now()).await
    }

    pub async fn run_round_at(
        &self,
        round_id: &str,
        round_index: u64,
        config: &RoundConfig,
        scheduled_date: DateTime<Utc>,
    ) -> Result<RoundResult, RoundError> {
        // Validate before touching the lock
        if round_id.trim().is_empty() {
            return Err(RoundError::Configuration("round_id must not be empty".to_string()));
        }
        config.validate()?;

        tracing::info!(
            "Starting round {} (index {}) for deployment {}: group size {}, lookback {}",
            round_id,
            round_index,
            self.deployment_id,
            config.group_size,
            config.lookback_window
        );

        let key = self.lock_key();
        let Some(lease) = self.lock.try_acquire(&key, self.options.lease_ttl).await? else {
            tracing::warn!(
                "Round {} skipped: lease {} is held by another run",
                round_id,
                key
            );
            return Err(RoundError::LockUnavailable {
                deployment_id: self.deployment_id.clone(),
            });
        };

        let deadline = tokio::time::Instant::now() + self.options.round_timeout;
        let outcome = self
            .execute(round_id, round_index, config, scheduled_date, &lease, deadline)
            .await;

        if let Err(e) = self.lock.release(&lease).await {
            tracing::warn!("Failed to release round lease {}: {}", lease.key, e);
        }

        let (mut result, notice) = match outcome {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(
                    "Round {} failed ({}, retryable: {}): {}",
                    round_id,
                    e.kind(),
                    e.is_retryable(),
                    e
                );
                return Err(e);
            }
        };

        result.notified = self.notify(&notice).await;

        tracing::info!(
            "Round {} committed: {} groups, {} carried over, {} relaxations, {} absorptions",
            round_id,
            result.records.len(),
            result.carried_over.len(),
            result.relaxations.len(),
            result.absorptions.len()
        );

        Ok(result)
    }

    async fn execute(
        &self,
        round_id: &str,
        round_index: u64,
        config: &RoundConfig,
        scheduled_date: DateTime<Utc>,
        lease: &Lease,
        deadline: tokio::time::Instant,
    ) -> Result<(RoundResult, RoundNotice), RoundError> {
        let Prepared {
            commit,
            plan,
            participants,
        } = tokio::time::timeout_at(
            deadline,
            self.prepare(round_id, round_index, config, scheduled_date),
        )
        .await
        .map_err(|_| self.timed_out(round_id))??;

        self.persist(&commit, lease, deadline).await?;

        let notice = build_notice(&self.deployment_id, &commit, &participants);
        let MatchPlan {
            carried_over,
            relaxations,
            absorptions,
            ..
        } = plan;

        let result = RoundResult {
            deployment_id: self.deployment_id.clone(),
            round_id: commit.round_id,
            round_index,
            records: commit.records,
            carried_over,
            relaxations,
            absorptions,
            eligible_participants: participants.len(),
            notified: false,
        };

        Ok((result, notice))
    }

    /// Load, score and group; everything up to the commit
    async fn prepare(
        &self,
        round_id: &str,
        round_index: u64,
        config: &RoundConfig,
        scheduled_date: DateTime<Utc>,
    ) -> Result<Prepared, RoundError> {
        let load_error = |stage: &'static str| {
            move |source: StoreError| RoundError::Load {
                round_id: round_id.to_string(),
                stage,
                source,
            }
        };

        // Rounds must be committed in index order
        let latest = self
            .history
            .latest_round_index(&self.deployment_id)
            .await
            .map_err(load_error("round index"))?;
        if let Some(latest) = latest.filter(|&latest| latest >= round_index) {
            return Err(RoundError::OutOfOrder {
                round_id: round_id.to_string(),
                round_index,
                latest,
            });
        }

        // Load the participant snapshot
        let listed = self
            .participants
            .list_active_participants(&self.deployment_id)
            .await
            .map_err(load_error("participants"))?;
        let snapshot = eligible_snapshot(listed);

        tracing::info!(
            "Round {}: {} eligible participants ({} inactive or paused)",
            round_id,
            snapshot.len(),
            snapshot.skipped_ineligible
        );

        if snapshot.len() < config.group_size {
            return Err(RoundError::InsufficientParticipants {
                round_id: round_id.to_string(),
                available: snapshot.len(),
                required: config.group_size,
                carried_over: snapshot.ids(),
            });
        }

        // Load the history window
        let entries = self
            .history
            .query_recent_pairs(&self.deployment_id, round_index, config.lookback_window)
            .await
            .map_err(load_error("history"))?;
        let mut tracker = HistoryTracker::from_entries(entries);

        let ids = snapshot.ids();
        let blocked = tracker.blocked_pairs(&ids, round_index, config.lookback_window);
        tracing::debug!(
            "Round {}: {} history entries, {} blocked pairs",
            round_id,
            tracker.entry_count(),
            blocked.count()
        );

        // Score and group
        let participants: Arc<[Participant]> = snapshot.participants.into();
        let scores = ScoreMatrix::compute_parallel(
            Arc::clone(&participants),
            config.weights,
            self.options.score_workers,
        )
        .await
        .map_err(|e| RoundError::Scoring(e.to_string()))?;

        let plan = MatchBuilder::from_config(config)
            .build(&scores, &blocked)
            .map_err(|e| match e {
                BuildError::Infeasible {
                    unmatched,
                    relaxation_steps,
                    blocked_pairs,
                } => RoundError::InfeasibleConstraints {
                    round_id: round_id.to_string(),
                    unmatched,
                    relaxation_steps,
                    blocked_pairs,
                },
                other => RoundError::Scoring(other.to_string()),
            })?;

        let records: Vec<MatchRecord> = plan
            .groups
            .iter()
            .map(|group| {
                MatchRecord::scheduled(
                    &self.deployment_id,
                    round_id,
                    round_index,
                    group.members.clone(),
                    group.average_score,
                    scheduled_date,
                )
            })
            .collect();
        let history = tracker.record(round_id, round_index, &plan.member_lists());

        let commit = RoundCommit {
            round_id: round_id.to_string(),
            round_index,
            records,
            history,
        };

        Ok(Prepared {
            commit,
            plan,
            participants,
        })
    }

    /// Save the commit with bounded exponential backoff
    ///
    /// The lease is rechecked before every attempt; a lost lease aborts
    /// without writing. A save cut off by the deadline may still have
    /// committed, so the round marker is read back before reporting a
    /// timeout.
    async fn persist(
        &self,
        commit: &RoundCommit,
        lease: &Lease,
        deadline: tokio::time::Instant,
    ) -> Result<(), RoundError> {
        let max_attempts = self.options.persistence_max_attempts.max(1);
        let mut backoff = self.options.persistence_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            tokio::time::timeout_at(deadline, self.ensure_lease(&commit.round_id, lease))
                .await
                .map_err(|_| self.timed_out(&commit.round_id))??;

            let saved = match tokio::time::timeout_at(deadline, self.sink.save_round(&self.deployment_id, commit)).await
            {
                Ok(saved) => saved,
                Err(_) => return self.settle_interrupted_save(commit).await,
            };

            match saved {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    return Err(RoundError::AlreadyCommitted {
                        round_id: commit.round_id.clone(),
                    })
                }
                Err(e) if attempt >= max_attempts => {
                    return Err(RoundError::PersistenceFailure {
                        round_id: commit.round_id.clone(),
                        attempts: attempt,
                        source: e,
                    })
                }
                Err(e) => {
                    tracing::warn!(
                        "Saving round {} failed (attempt {}/{}): {}; retrying in {:?}",
                        commit.round_id,
                        attempt,
                        max_attempts,
                        e,
                        backoff
                    );
                    tokio::time::timeout_at(deadline, tokio::time::sleep(backoff))
                        .await
                        .map_err(|_| self.timed_out(&commit.round_id))?;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    /// Decide the outcome of a save abandoned at the deadline
    ///
    /// The lease keeps other runs out, so a latest index at or past this
    /// round means this commit landed.
    async fn settle_interrupted_save(&self, commit: &RoundCommit) -> Result<(), RoundError> {
        match self.history.latest_round_index(&self.deployment_id).await {
            Ok(Some(latest)) if latest >= commit.round_index => {
                tracing::warn!(
                    "Round {} reached its deadline during the save, but the commit is in place",
                    commit.round_id
                );
                Ok(())
            }
            Ok(_) => Err(self.timed_out(&commit.round_id)),
            Err(e) => {
                tracing::warn!(
                    "Could not read back round {} after its deadline: {}",
                    commit.round_id,
                    e
                );
                Err(self.timed_out(&commit.round_id))
            }
        }
    }

    fn timed_out(&self, round_id: &str) -> RoundError {
        RoundError::TimeoutExceeded {
            round_id: round_id.to_string(),
            budget: self.options.round_timeout,
        }
    }

    async fn ensure_lease(&self, round_id: &str, lease: &Lease) -> Result<(), RoundError> {
        if !lease.is_within_ttl() || !self.lock.is_held(lease).await? {
            tracing::warn!("Round {} lost its lease {} before commit", round_id, lease.key);
            return Err(RoundError::LeaseExpired {
                round_id: round_id.to_string(),
            });
        }
        Ok(())
    }

    /// Deliver the notice; failures never undo the commit
    async fn notify(&self, notice: &RoundNotice) -> bool {
        match tokio::time::timeout(self.options.notify_timeout, self.notifier.notify(notice)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("Notification for round {} failed: {}", notice.round_id, e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Notification for round {} timed out after {:?}",
                    notice.round_id,
                    self.options.notify_timeout
                );
                false
            }
        }
    }
}

/// Output of the pre-commit stages
struct Prepared {
    commit: RoundCommit,
    plan: MatchPlan,
    participants: Arc<[Participant]>,
}

fn build_notice(deployment_id: &str, commit: &RoundCommit, participants: &[Participant]) -> RoundNotice {
    // participants are sorted by id
    let lookup = |id: &String| {
        participants
            .binary_search_by(|p| p.id.cmp(id))
            .ok()
            .map(|i| &participants[i])
    };

    let groups = commit
        .records
        .iter()
        .map(|record| {
            let members: Vec<&Participant> = record.members.iter().filter_map(lookup).collect();
            GroupNotice {
                match_id: record.id.to_string(),
                members: record.members.clone(),
                average_score: record.average_score,
                shared_topics: common_items(members.iter().map(|p| &p.topics)),
                common_availability: common_items(members.iter().map(|p| &p.availability)),
            }
        })
        .collect();

    RoundNotice {
        deployment_id: deployment_id.to_string(),
        round_id: commit.round_id.clone(),
        round_index: commit.round_index,
        groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{InMemoryLock, InMemoryStore, RecordingNotifier};

    fn orchestrator(store: InMemoryStore) -> (RoundOrchestrator, Arc<InMemoryStore>, Arc<RecordingNotifier>) {
        let store = Arc::new(store);
        let notifier = Arc::new(RecordingNotifier::new());
        let orchestrator = RoundOrchestrator::with_store(
            "acme",
            Arc::clone(&store),
            Arc::new(InMemoryLock::new()),
            notifier.clone(),
            OrchestratorOptions {
                persistence_backoff: Duration::from_millis(1),
                score_workers: 2,
                ..OrchestratorOptions::default()
            },
        );
        (orchestrator, store, notifier)
    }

    #[test]
    fn test_lock_key_is_scoped_by_deployment() {
        let (orchestrator, _, _) = orchestrator(InMemoryStore::new());
        assert_eq!(orchestrator.lock_key(), "coffee-match:round-lock:acme");
    }

    #[test]
    fn test_notice_lists_shared_preferences() {
        let participants = vec![
            Participant::new("a").with_topics(["rust", "tea"]).with_availability(["mon"]),
            Participant::new("b").with_topics(["rust"]).with_availability(["mon", "tue"]),
        ];
        let record = MatchRecord::scheduled("acme", "r1", 1, vec!["a".into(), "b".into()], 0.5, Utc::now());
        let commit = RoundCommit {
            round_id: "r1".into(),
            round_index: 1,
            records: vec![record],
            history: Vec::new(),
        };

        let notice = build_notice("acme", &commit, &participants);

        assert_eq!(notice.groups.len(), 1);
        assert_eq!(notice.groups[0].shared_topics, vec!["rust"]);
        assert_eq!(notice.groups[0].common_availability, vec!["mon"]);
    }

    #[tokio::test]
    async fn test_round_commits_and_notifies() {
        let participants = (0..6).map(|i| Participant::new(format!("p{}", i))).collect();
        let (orchestrator, store, notifier) = orchestrator(InMemoryStore::new().with_participants("acme", participants));

        let result = orchestrator.run_round("r1", 1, &RoundConfig::default()).await.unwrap();

        assert_eq!(result.records.len(), 3);
        assert!(result.notified);
        assert_eq!(store.records("acme").await.len(), 3);
        assert_eq!(store.history("acme").await.len(), 3);
        assert_eq!(notifier.notices().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_takes_no_lock() {
        let (orchestrator, store, _) = orchestrator(InMemoryStore::new());
        let config = RoundConfig {
            group_size: 1,
            ..RoundConfig::default()
        };

        let err = orchestrator.run_round("r1", 1, &config).await.unwrap_err();

        assert!(matches!(err, RoundError::Configuration(_)));
        assert_eq!(store.save_attempts(), 0);
    }
}
