use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use crate::models::{MatchHistoryEntry, MatchRecord, Participant, RoundCommit, RoundNotice};
use crate::services::traits::{
    window_start, HistoryStore, Lease, LockError, MatchSink, NotifyError, Notifier, ParticipantSource, RoundLock,
    StoreError,
};

#[derive(Debug, Default)]
struct Deployment {
    participants: Vec<Participant>,
    history: Vec<MatchHistoryEntry>,
    records: Vec<MatchRecord>,
    // round_id -> round_index
    rounds: HashMap<String, u64>,
}

/// Process-local store for dry runs and tests
///
/// Supports injected latency and failures so orchestration paths can be
/// exercised without a database.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    deployments: RwLock<HashMap<String, Deployment>>,
    latency: Duration,
    ack_latency: Duration,
    failing_saves: AtomicU32,
    failing_loads: AtomicBool,
    save_attempts: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_participants(mut self, deployment_id: &str, participants: Vec<Participant>) -> Self {
        self.deployments
            .get_mut()
            .entry(deployment_id.to_string())
            .or_default()
            .participants = participants;
        self
    }

    /// Seed a committed round together with its history entries
    pub fn with_committed_round(
        mut self,
        deployment_id: &str,
        round_id: &str,
        round_index: u64,
        history: Vec<MatchHistoryEntry>,
    ) -> Self {
        let deployment = self.deployments.get_mut().entry(deployment_id.to_string()).or_default();
        deployment.rounds.insert(round_id.to_string(), round_index);
        deployment.history.extend(history);
        self
    }

    /// Delay applied to every load and save
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay between a save being applied and the call returning
    pub fn with_ack_latency(mut self, latency: Duration) -> Self {
        self.ack_latency = latency;
        self
    }

    /// Make the next `count` saves fail with `StoreError::Unavailable`
    pub fn fail_next_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    pub fn fail_loads(&self, failing: bool) {
        self.failing_loads.store(failing, Ordering::SeqCst);
    }

    pub fn save_attempts(&self) -> u32 {
        self.save_attempts.load(Ordering::SeqCst)
    }

    pub async fn records(&self, deployment_id: &str) -> Vec<MatchRecord> {
        self.deployments
            .read()
            .await
            .get(deployment_id)
            .map(|d| d.records.clone())
            .unwrap_or_default()
    }

    pub async fn history(&self, deployment_id: &str) -> Vec<MatchHistoryEntry> {
        self.deployments
            .read()
            .await
            .get(deployment_id)
            .map(|d| d.history.clone())
            .unwrap_or_default()
    }

    pub async fn committed_rounds(&self, deployment_id: &str) -> usize {
        self.deployments
            .read()
            .await
            .get(deployment_id)
            .map_or(0, |d| d.rounds.len())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn check_loads(&self) -> Result<(), StoreError> {
        if self.failing_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected load failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ParticipantSource for InMemoryStore {
    async fn list_active_participants(&self, deployment_id: &str) -> Result<Vec<Participant>, StoreError> {
        self.delay().await;
        self.check_loads()?;
        Ok(self
            .deployments
            .read()
            .await
            .get(deployment_id)
            .map(|d| d.participants.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    async fn query_recent_pairs(
        &self,
        deployment_id: &str,
        round_index: u64,
        window: u64,
    ) -> Result<Vec<MatchHistoryEntry>, StoreError> {
        self.delay().await;
        self.check_loads()?;
        if window == 0 {
            return Ok(Vec::new());
        }

        let lower = window_start(round_index, window);
        Ok(self
            .deployments
            .read()
            .await
            .get(deployment_id)
            .map(|d| {
                d.history
                    .iter()
                    .filter(|e| e.round_index >= lower)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_round_index(&self, deployment_id: &str) -> Result<Option<u64>, StoreError> {
        self.check_loads()?;
        Ok(self
            .deployments
            .read()
            .await
            .get(deployment_id)
            .and_then(|d| d.rounds.values().copied().max()))
    }
}

#[async_trait]
impl MatchSink for InMemoryStore {
    async fn save_round(&self, deployment_id: &str, commit: &RoundCommit) -> Result<(), StoreError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let remaining = self.failing_saves.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_saves.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected save failure".to_string()));
        }

        {
            let mut deployments = self.deployments.write().await;
            let deployment = deployments.entry(deployment_id.to_string()).or_default();
            if deployment.rounds.contains_key(&commit.round_id) {
                return Err(StoreError::Conflict {
                    deployment_id: deployment_id.to_string(),
                    round_id: commit.round_id.clone(),
                });
            }

            deployment.rounds.insert(commit.round_id.clone(), commit.round_index);
            deployment.records.extend(commit.records.iter().cloned());
            deployment.history.extend(commit.history.iter().cloned());
        }

        if !self.ack_latency.is_zero() {
            tokio::time::sleep(self.ack_latency).await;
        }
        Ok(())
    }
}

/// Process-local round lock with wall-clock expiry
#[derive(Debug, Default)]
pub struct InMemoryLock {
    // key -> (token, expires_at)
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoundLock for InMemoryLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let mut held = self.held.lock().await;
        if let Some((_, expires_at)) = held.get(key) {
            if Instant::now() < *expires_at {
                return Ok(None);
            }
        }

        let lease = Lease::new(key, ttl);
        held.insert(key.to_string(), (lease.token.clone(), lease.acquired_at + ttl));
        Ok(Some(lease))
    }

    async fn is_held(&self, lease: &Lease) -> Result<bool, LockError> {
        let held = self.held.lock().await;
        Ok(matches!(
            held.get(&lease.key),
            Some((token, expires_at)) if *token == lease.token && Instant::now() < *expires_at
        ))
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        if matches!(held.get(&lease.key), Some((token, _)) if *token == lease.token) {
            held.remove(&lease.key);
        }
        Ok(())
    }
}

/// Notifier that keeps every notice it receives
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<RoundNotice>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every delivery fails
    pub fn failing() -> Self {
        Self {
            notices: Mutex::new(Vec::new()),
            failing: AtomicBool::new(true),
        }
    }

    pub async fn notices(&self) -> Vec<RoundNotice> {
        self.notices.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &RoundNotice) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Unavailable("injected notifier failure".to_string()));
        }
        self.notices.lock().await.push(notice.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PairKey;

    fn commit(round_id: &str, round_index: u64) -> RoundCommit {
        RoundCommit {
            round_id: round_id.to_string(),
            round_index,
            records: Vec::new(),
            history: vec![MatchHistoryEntry {
                pair_key: PairKey::new("a", "b"),
                round_id: round_id.to_string(),
                round_index,
            }],
        }
    }

    #[tokio::test]
    async fn test_second_commit_of_round_conflicts() {
        let store = InMemoryStore::new();
        store.save_round("d", &commit("r1", 1)).await.unwrap();

        let err = store.save_round("d", &commit("r1", 1)).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.history("d").await.len(), 1);
        assert_eq!(store.latest_round_index("d").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_history_window_filters_old_entries() {
        let store = InMemoryStore::new();
        store.save_round("d", &commit("r1", 1)).await.unwrap();
        store.save_round("d", &commit("r5", 5)).await.unwrap();

        let recent = store.query_recent_pairs("d", 6, 2).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].round_index, 5);
        assert!(store.query_recent_pairs("d", 6, 0).await.unwrap().is_empty());
        assert!(store.query_recent_pairs("other", 6, 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_save_failures_are_consumed() {
        let store = InMemoryStore::new();
        store.fail_next_saves(1);

        assert!(store.save_round("d", &commit("r1", 1)).await.is_err());
        assert!(store.save_round("d", &commit("r1", 1)).await.is_ok());
        assert_eq!(store.save_attempts(), 2);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let lock = InMemoryLock::new();
        let lease = lock.try_acquire("k", Duration::from_secs(30)).await.unwrap().unwrap();

        assert!(lock.try_acquire("k", Duration::from_secs(30)).await.unwrap().is_none());
        assert!(lock.is_held(&lease).await.unwrap());

        lock.release(&lease).await.unwrap();
        assert!(!lock.is_held(&lease).await.unwrap());
        assert!(lock.try_acquire("k", Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let lock = InMemoryLock::new();
        let stale = lock.try_acquire("k", Duration::from_millis(1)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = lock.try_acquire("k", Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(!lock.is_held(&stale).await.unwrap());

        // Releasing the stale lease must not drop the new holder
        lock.release(&stale).await.unwrap();
        assert!(lock.is_held(&fresh).await.unwrap());
    }
}
