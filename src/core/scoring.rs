use std::sync::Arc;

use crate::core::similarity::jaccard;
use crate::models::{Participant, ScoringWeights};

/// Calculate a compatibility score (0-1) between two participants
///
/// Scoring formula:
/// score = (
///     topic_weight * jaccard(topics) +
///     availability_weight * jaccard(availability) +
///     length_weight * (same meeting length ? 1 : 0)
/// )
///
/// Pure: the same inputs always give the same score.
#[inline]
pub fn calculate_compatibility(a: &Participant, b: &Participant, weights: &ScoringWeights) -> f64 {
    let topic_score = jaccard(&a.topics, &b.topics);
    let availability_score = jaccard(&a.availability, &b.availability);
    let length_score = if a.meeting_length == b.meeting_length { 1.0 } else { 0.0 };

    let total = topic_score * weights.topic
        + availability_score * weights.availability
        + length_score * weights.length;

    total.clamp(0.0, 1.0)
}

/// Symmetric pairwise score table for one round's snapshot
///
/// Row/column `i` refers to `ids()[i]`. The diagonal is 0.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreMatrix {
    ids: Vec<String>,
    scores: Vec<f64>,
}

impl ScoreMatrix {
    /// Compute every pair sequentially
    pub fn compute(participants: &[Participant], weights: &ScoringWeights) -> Self {
        let n = participants.len();
        let rows = (0..n)
            .map(|i| score_row(participants, i, weights))
            .collect::<Vec<_>>();
        Self::assemble(participants, rows)
    }

    /// Compute the matrix across `workers` blocking tasks
    ///
    /// Each task owns a contiguous range of rows; rows only read the shared
    /// participant slice so no synchronisation is needed.
    pub async fn compute_parallel(
        participants: Arc<[Participant]>,
        weights: ScoringWeights,
        workers: usize,
    ) -> Result<Self, tokio::task::JoinError> {
        let n = participants.len();
        let workers = workers.max(1).min(n.max(1));
        let chunk = n.div_ceil(workers).max(1);

        let mut handles = Vec::with_capacity(workers);
        for start in (0..n).step_by(chunk) {
            let end = (start + chunk).min(n);
            let participants = Arc::clone(&participants);
            handles.push(tokio::task::spawn_blocking(move || {
                (start..end)
                    .map(|i| score_row(&participants, i, &weights))
                    .collect::<Vec<_>>()
            }));
        }

        let mut rows = Vec::with_capacity(n);
        for handle in handles {
            rows.extend(handle.await?);
        }

        Ok(Self::assemble(&participants, rows))
    }

    /// Build a matrix from an arbitrary score function over index pairs
    pub fn from_fn<F>(ids: Vec<String>, mut score: F) -> Self
    where
        F: FnMut(usize, usize) -> f64,
    {
        let n = ids.len();
        let mut scores = vec![0.0; n * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let s = score(i, j).clamp(0.0, 1.0);
                scores[i * n + j] = s;
                scores[j * n + i] = s;
            }
        }
        Self { ids, scores }
    }

    fn assemble(participants: &[Participant], rows: Vec<Vec<f64>>) -> Self {
        let n = participants.len();
        let mut scores = vec![0.0; n * n];
        for (i, row) in rows.into_iter().enumerate() {
            // row i holds scores for j in (i + 1)..n
            for (offset, s) in row.into_iter().enumerate() {
                let j = i + 1 + offset;
                scores[i * n + j] = s;
                scores[j * n + i] = s;
            }
        }
        Self {
            ids: participants.iter().map(|p| p.id.clone()).collect(),
            scores,
        }
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.scores[i * self.ids.len() + j]
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Mean pairwise score among the given members (0 for fewer than two)
    pub fn group_mean(&self, members: &[usize]) -> f64 {
        let k = members.len();
        if k < 2 {
            return 0.0;
        }
        let mut sum = 0.0;
        for (x, &i) in members.iter().enumerate() {
            for &j in &members[x + 1..] {
                sum += self.get(i, j);
            }
        }
        sum / (k * (k - 1) / 2) as f64
    }
}

fn score_row(participants: &[Participant], i: usize, weights: &ScoringWeights) -> Vec<f64> {
    let a = &participants[i];
    participants[i + 1..]
        .iter()
        .map(|b| calculate_compatibility(a, b, weights))
        .collect()
}
