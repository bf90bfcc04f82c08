use std::collections::HashMap;

use crate::models::{MatchHistoryEntry, PairKey};

/// Recency index over past pairings
///
/// Holds only the most recent round each pair met in, which is all the
/// lookback rule needs. Entries are never removed; retention of the
/// underlying log is a storage concern.
#[derive(Debug, Clone, Default)]
pub struct HistoryTracker {
    // low id -> high id -> latest round_index
    latest: HashMap<String, HashMap<String, u64>>,
    entries: usize,
}

impl HistoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = MatchHistoryEntry>,
    {
        let mut tracker = Self::new();
        for entry in entries {
            tracker.insert(&entry);
        }
        tracker
    }

    fn insert(&mut self, entry: &MatchHistoryEntry) {
        let slot = self
            .latest
            .entry(entry.pair_key.low().to_string())
            .or_default()
            .entry(entry.pair_key.high().to_string())
            .or_insert(entry.round_index);
        *slot = (*slot).max(entry.round_index);
        self.entries += 1;
    }

    /// Number of entries folded into the index
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Most recent round in which `a` and `b` were grouped together
    pub fn last_met(&self, a: &str, b: &str) -> Option<u64> {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        self.latest.get(low)?.get(high).copied()
    }

    /// Round index of the entry blocking `{a, b}` in `round_index`, if any
    ///
    /// A pair is blocked when it met at most `lookback_window` rounds ago.
    /// An entry at or after `round_index` always blocks. A window of 0
    /// disables the rule.
    pub fn blocking_round(&self, a: &str, b: &str, round_index: u64, lookback_window: u64) -> Option<u64> {
        if lookback_window == 0 {
            return None;
        }
        let met = self.last_met(a, b)?;
        if met >= round_index || round_index - met <= lookback_window {
            Some(met)
        } else {
            None
        }
    }

    pub fn is_disallowed(&self, a: &str, b: &str, round_index: u64, lookback_window: u64) -> bool {
        self.blocking_round(a, b, round_index, lookback_window).is_some()
    }

    /// Precompute the blocked pairs for a round's snapshot
    pub fn blocked_pairs(&self, ids: &[String], round_index: u64, lookback_window: u64) -> BlockedPairs {
        let n = ids.len();
        let mut blocked = BlockedPairs::none(n);
        if lookback_window == 0 || self.latest.is_empty() {
            return blocked;
        }
        for i in 0..n {
            for j in (i + 1)..n {
                if let Some(round) = self.blocking_round(&ids[i], &ids[j], round_index, lookback_window) {
                    blocked.set(i, j, round);
                }
            }
        }
        blocked
    }

    /// Append one entry per unordered pair of co-members of every group
    ///
    /// A group of `k` yields `k * (k - 1) / 2` entries. The returned entries
    /// are what the caller persists; the tracker is updated in place.
    pub fn record(&mut self, round_id: &str, round_index: u64, groups: &[Vec<String>]) -> Vec<MatchHistoryEntry> {
        let mut recorded = Vec::new();
        for group in groups {
            for (x, a) in group.iter().enumerate() {
                for b in &group[x + 1..] {
                    let entry = MatchHistoryEntry {
                        pair_key: PairKey::new(a.clone(), b.clone()),
                        round_id: round_id.to_string(),
                        round_index,
                    };
                    self.insert(&entry);
                    recorded.push(entry);
                }
            }
        }
        recorded
    }
}

/// Dense table of blocked pairs over snapshot indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedPairs {
    n: usize,
    rounds: Vec<Option<u64>>,
    count: usize,
}

impl BlockedPairs {
    /// No pair blocked
    pub fn none(n: usize) -> Self {
        Self {
            n,
            rounds: vec![None; n * n],
            count: 0,
        }
    }

    pub fn set(&mut self, i: usize, j: usize, round_index: u64) {
        if self.rounds[i * self.n + j].is_none() {
            self.count += 1;
        }
        self.rounds[i * self.n + j] = Some(round_index);
        self.rounds[j * self.n + i] = Some(round_index);
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> Option<u64> {
        self.rounds[i * self.n + j]
    }

    /// Number of blocked unordered pairs
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(a: &str, b: &str, round_index: u64) -> MatchHistoryEntry {
        MatchHistoryEntry {
            pair_key: PairKey::new(a, b),
            round_id: format!("round-{}", round_index),
            round_index,
        }
    }

    #[test]
    fn test_lookback_zero_allows_everything() {
        let tracker = HistoryTracker::from_entries(vec![entry("a", "b", 9)]);
        assert!(!tracker.is_disallowed("a", "b", 10, 0));
    }

    #[test]
    fn test_met_last_round_blocked_with_window_one() {
        let tracker = HistoryTracker::from_entries(vec![entry("a", "b", 4)]);
        assert!(tracker.is_disallowed("a", "b", 5, 1));
        assert!(tracker.is_disallowed("b", "a", 5, 1));
        assert!(!tracker.is_disallowed("a", "b", 6, 1));
        assert!(tracker.is_disallowed("a", "b", 6, 2));
    }

    #[test]
    fn test_latest_entry_wins() {
        let tracker = HistoryTracker::from_entries(vec![entry("a", "b", 2), entry("b", "a", 7), entry("a", "b", 5)]);
        assert_eq!(tracker.last_met("a", "b"), Some(7));
        assert_eq!(tracker.blocking_round("a", "b", 8, 3), Some(7));
        assert_eq!(tracker.entry_count(), 3);
    }

    #[test]
    fn test_entry_from_later_round_blocks() {
        let tracker = HistoryTracker::from_entries(vec![entry("a", "b", 12)]);
        assert_eq!(tracker.blocking_round("a", "b", 10, 1), Some(12));
    }

    #[test]
    fn test_record_appends_all_co_member_pairs() {
        let mut tracker = HistoryTracker::new();
        let groups = vec![
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            vec!["d".to_string(), "e".to_string()],
        ];

        let recorded = tracker.record("r3", 3, &groups);

        assert_eq!(recorded.len(), 3 + 1);
        assert!(recorded.iter().all(|e| e.round_index == 3 && e.round_id == "r3"));
        assert!(tracker.is_disallowed("c", "a", 4, 1));
        assert!(tracker.is_disallowed("d", "e", 4, 1));
        assert!(!tracker.is_disallowed("a", "d", 4, 1));
    }

    #[test]
    fn test_blocked_pairs_table() {
        let tracker = HistoryTracker::from_entries(vec![entry("a", "c", 1), entry("b", "c", 0)]);
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let blocked = tracker.blocked_pairs(&ids, 2, 1);

        assert_eq!(blocked.get(0, 2), Some(1));
        assert_eq!(blocked.get(2, 0), Some(1));
        assert_eq!(blocked.get(1, 2), None);
        assert_eq!(blocked.count(), 1);
    }
}
