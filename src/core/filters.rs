use crate::models::Participant;

/// Eligible participants for one round, sorted by id
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub participants: Vec<Participant>,
    pub skipped_ineligible: usize,
    pub duplicate_ids: Vec<String>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }
}

/// Check whether a participant takes part in matching
///
/// Paused participants keep their profile but sit out rounds.
#[inline]
pub fn is_eligible(participant: &Participant) -> bool {
    participant.active && !participant.paused
}

/// Filter a raw directory listing down to the round's snapshot
///
/// Output is sorted by id so nothing downstream depends on the order the
/// directory returned. A repeated id keeps its first occurrence.
pub fn eligible_snapshot(participants: Vec<Participant>) -> Snapshot {
    let total = participants.len();
    let mut eligible: Vec<Participant> = participants.into_iter().filter(is_eligible).collect();
    let skipped_ineligible = total - eligible.len();

    // Stable sort keeps the directory order among equal ids
    eligible.sort_by(|a, b| a.id.cmp(&b.id));

    let mut duplicate_ids = Vec::new();
    eligible.dedup_by(|later, earlier| {
        let duplicate = later.id == earlier.id;
        if duplicate {
            duplicate_ids.push(later.id.clone());
        }
        duplicate
    });

    if !duplicate_ids.is_empty() {
        tracing::warn!(
            "Participant source returned duplicate ids, keeping first occurrence: {:?}",
            duplicate_ids
        );
    }

    Snapshot {
        participants: eligible,
        skipped_ineligible,
        duplicate_ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_and_paused_filtered() {
        let mut inactive = Participant::new("b");
        inactive.active = false;
        let mut paused = Participant::new("c");
        paused.paused = true;

        let snapshot = eligible_snapshot(vec![Participant::new("a"), inactive, paused]);

        assert_eq!(snapshot.ids(), vec!["a"]);
        assert_eq!(snapshot.skipped_ineligible, 2);
    }

    #[test]
    fn test_snapshot_sorted_by_id() {
        let snapshot = eligible_snapshot(vec![
            Participant::new("carol"),
            Participant::new("alice"),
            Participant::new("bob"),
        ]);
        assert_eq!(snapshot.ids(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let first = Participant::new("dup").with_topics(["rust"]);
        let second = Participant::new("dup").with_topics(["go"]);

        let snapshot = eligible_snapshot(vec![first, Participant::new("x"), second]);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.duplicate_ids, vec!["dup"]);
        assert!(snapshot.participants[0].topics.contains("rust"));
    }
}
