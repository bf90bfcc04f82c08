use std::collections::{BTreeSet, HashSet};

use thiserror::Error;

use crate::core::history::BlockedPairs;
use crate::core::scoring::ScoreMatrix;
use crate::models::{Absorption, LeftoverPolicy, Relaxation, RoundConfig};

/// Minimum gain for a swap to count as an improvement
const SWAP_EPSILON: f64 = 1e-12;

/// Upper bound on refinement passes over the group set
const MAX_REFINEMENT_PASSES: usize = 256;

/// Errors produced while building groups
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error(
        "constraints infeasible after {relaxation_steps} relaxation steps; {} participants unplaced: {unmatched:?}",
        unmatched.len()
    )]
    Infeasible {
        unmatched: Vec<String>,
        relaxation_steps: u32,
        blocked_pairs: usize,
    },

    #[error("score matrix covers {scores} participants but constraint table covers {blocked}")]
    DimensionMismatch { scores: usize, blocked: usize },
}

/// A group chosen by the builder
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedGroup {
    pub members: Vec<String>,
    pub average_score: f64,
}

/// Result of the matching process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchPlan {
    pub groups: Vec<PlannedGroup>,
    pub carried_over: Vec<String>,
    pub relaxations: Vec<Relaxation>,
    pub absorptions: Vec<Absorption>,
}

impl MatchPlan {
    pub fn member_lists(&self) -> Vec<Vec<String>> {
        self.groups.iter().map(|g| g.members.clone()).collect()
    }
}

/// Core grouping algorithm
///
/// # Pair case (`group_size == 2`)
/// 1. Candidate edges: every pair not blocked by history
/// 2. Sort by score descending, ties by the smaller `(id_a, id_b)`
/// 3. Greedy walk committing edges whose endpoints are both free
/// 4. While more participants are unmatched than an odd count explains,
///    reintroduce the blocked edge with the oldest blocking entry and
///    rerun the walk over the unmatched subset
/// 5. A single leftover joins the group holding its best-scoring member
///
/// # Group case (`group_size > 2`)
/// 1. Seed a group with the best free edge
/// 2. Grow it with the candidate maximizing the group's mean score
/// 3. Refine with single-member swaps between groups
/// 4. Leftovers join the highest-mean groups, one each
///
/// Participants are addressed by their index in the score matrix, which is
/// ordered by id; every tie is settled by that order so identical inputs
/// always yield identical groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchBuilder {
    group_size: usize,
    max_relaxation_steps: u32,
    leftover_policy: LeftoverPolicy,
}

impl MatchBuilder {
    pub fn new(group_size: usize, max_relaxation_steps: u32, leftover_policy: LeftoverPolicy) -> Self {
        Self {
            group_size: group_size.max(2),
            max_relaxation_steps,
            leftover_policy,
        }
    }

    pub fn from_config(config: &RoundConfig) -> Self {
        Self::new(
            config.group_size,
            config.max_relaxation_steps,
            config.leftover_policy,
        )
    }

    /// Partition the snapshot behind `scores` into groups
    pub fn build(&self, scores: &ScoreMatrix, blocked: &BlockedPairs) -> Result<MatchPlan, BuildError> {
        if scores.len() != blocked.len() {
            return Err(BuildError::DimensionMismatch {
                scores: scores.len(),
                blocked: blocked.len(),
            });
        }

        let mut ws = Workspace::new(scores, blocked, self.max_relaxation_steps);
        let draft = if self.group_size == 2 {
            build_pairs(&mut ws)
        } else {
            build_groups(&mut ws, self.group_size)
        };

        let Draft {
            mut groups,
            leftovers,
            mut unplaced,
        } = draft;

        let mut absorptions = Vec::new();
        let mut carried = Vec::new();
        match self.leftover_policy {
            LeftoverPolicy::CarryForward => carried = leftovers,
            LeftoverPolicy::Absorb if self.group_size == 2 => {
                for left in leftovers {
                    if groups.is_empty() {
                        carried.push(left);
                    } else {
                        match absorb_by_best_member(&mut ws, &mut groups, left) {
                            Some(absorption) => absorptions.push(absorption),
                            None => unplaced.push(left),
                        }
                    }
                }
            }
            LeftoverPolicy::Absorb => {
                let (placed, rest) = distribute_to_best_groups(&mut ws, &mut groups, leftovers);
                absorptions.extend(placed);
                unplaced.extend(rest);
            }
        }

        carried.extend(unplaced);
        carried.sort_unstable();

        if ws.exhausted && !carried.is_empty() {
            return Err(BuildError::Infeasible {
                unmatched: carried.iter().map(|&i| ws.id(i).to_string()).collect(),
                relaxation_steps: ws.used,
                blocked_pairs: blocked.count(),
            });
        }

        let plan = MatchPlan {
            groups: groups
                .iter()
                .map(|members| {
                    let mut ids: Vec<String> = members.iter().map(|&i| ws.id(i).to_string()).collect();
                    ids.sort_unstable();
                    PlannedGroup {
                        members: ids,
                        average_score: scores.group_mean(members),
                    }
                })
                .collect(),
            carried_over: carried.iter().map(|&i| ws.id(i).to_string()).collect(),
            relaxations: ws.relaxations,
            absorptions,
        };

        tracing::debug!(
            "Built {} groups of target size {} ({} carried over, {} relaxations)",
            plan.groups.len(),
            self.group_size,
            plan.carried_over.len(),
            plan.relaxations.len()
        );

        Ok(plan)
    }
}

/// Intermediate grouping before leftover policy is applied
struct Draft {
    groups: Vec<Vec<usize>>,
    leftovers: Vec<usize>,
    unplaced: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    a: usize,
    b: usize,
    score: f64,
}

fn sort_edges(edges: &mut [Edge]) {
    edges.sort_by(|x, y| {
        y.score
            .total_cmp(&x.score)
            .then_with(|| (x.a, x.b).cmp(&(y.a, y.b)))
    });
}

#[inline]
fn ordered(i: usize, j: usize) -> (usize, usize) {
    if i < j {
        (i, j)
    } else {
        (j, i)
    }
}

/// Mutable state shared by every phase of one build
struct Workspace<'a> {
    scores: &'a ScoreMatrix,
    blocked: &'a BlockedPairs,
    relaxed: HashSet<(usize, usize)>,
    relaxations: Vec<Relaxation>,
    budget: u32,
    used: u32,
    exhausted: bool,
}

impl<'a> Workspace<'a> {
    fn new(scores: &'a ScoreMatrix, blocked: &'a BlockedPairs, budget: u32) -> Self {
        Self {
            scores,
            blocked,
            relaxed: HashSet::new(),
            relaxations: Vec::new(),
            budget,
            used: 0,
            exhausted: false,
        }
    }

    fn id(&self, i: usize) -> &'a str {
        &self.scores.ids()[i]
    }

    #[inline]
    fn score(&self, i: usize, j: usize) -> f64 {
        self.scores.get(i, j)
    }

    /// Blocking round of a pair, ignoring pairs already relaxed
    fn blocking(&self, i: usize, j: usize) -> Option<u64> {
        let round = self.blocked.get(i, j)?;
        if self.relaxed.contains(&ordered(i, j)) {
            None
        } else {
            Some(round)
        }
    }

    #[inline]
    fn allowed(&self, i: usize, j: usize) -> bool {
        self.blocking(i, j).is_none()
    }

    fn compatible(&self, candidate: usize, members: &[usize]) -> bool {
        members.iter().all(|&m| self.allowed(candidate, m))
    }

    fn conflicts(&self, candidate: usize, members: &[usize]) -> Vec<(usize, usize)> {
        members
            .iter()
            .filter(|&&m| !self.allowed(candidate, m))
            .map(|&m| ordered(candidate, m))
            .collect()
    }

    /// Reintroduce blocked pairs oldest first, one budget step each
    ///
    /// All-or-nothing: if the budget cannot cover every pair nothing is
    /// relaxed and the workspace is marked exhausted.
    fn relax(&mut self, pairs: &[(usize, usize)]) -> bool {
        let mut pending: Vec<(u64, usize, usize)> = pairs
            .iter()
            .filter_map(|&(i, j)| {
                let (i, j) = ordered(i, j);
                self.blocking(i, j).map(|round| (round, i, j))
            })
            .collect();
        pending.sort_unstable();
        pending.dedup();

        let cost = pending.len() as u32;
        if self.used + cost > self.budget {
            self.exhausted = true;
            return false;
        }
        for (round, i, j) in pending {
            self.relaxed.insert((i, j));
            self.used += 1;
            tracing::warn!(
                "Relaxing history constraint: {} and {} met in round {} (step {}/{})",
                self.id(i),
                self.id(j),
                round,
                self.used,
                self.budget
            );
            self.relaxations.push(Relaxation {
                participant_a: self.id(i).to_string(),
                participant_b: self.id(j).to_string(),
                blocking_round_index: round,
            });
        }
        true
    }

    /// Allowed edges within `pool`, best first
    fn allowed_edges(&self, pool: &BTreeSet<usize>) -> Vec<Edge> {
        let mut edges = Vec::new();
        for &a in pool {
            for &b in pool.range(a + 1..) {
                if self.allowed(a, b) {
                    edges.push(Edge {
                        a,
                        b,
                        score: self.score(a, b),
                    });
                }
            }
        }
        sort_edges(&mut edges);
        edges
    }

    /// The blocked pair in `pool` whose blocking entry is oldest
    ///
    /// Ties prefer the higher score, then the smaller pair.
    fn oldest_blocked_among(&self, pool: &BTreeSet<usize>) -> Option<(usize, usize)> {
        let mut best: Option<(u64, f64, usize, usize)> = None;
        for &a in pool {
            for &b in pool.range(a + 1..) {
                let Some(round) = self.blocking(a, b) else {
                    continue;
                };
                let score = self.score(a, b);
                let better = match best {
                    None => true,
                    Some((r, s, _, _)) => round < r || (round == r && score > s),
                };
                if better {
                    best = Some((round, score, a, b));
                }
            }
        }
        best.map(|(_, _, a, b)| (a, b))
    }
}

fn build_pairs(ws: &mut Workspace<'_>) -> Draft {
    let n = ws.scores.len();
    let mut unmatched: BTreeSet<usize> = (0..n).collect();
    let mut groups = Vec::new();

    greedy_pairs(ws, &mut unmatched, &mut groups);

    // The greedy walk is maximal, so two or more unmatched participants
    // means every pair among them is blocked.
    while unmatched.len() > n % 2 {
        let Some(pair) = ws.oldest_blocked_among(&unmatched) else {
            break;
        };
        if !ws.relax(&[pair]) {
            break;
        }
        greedy_pairs(ws, &mut unmatched, &mut groups);
    }

    if unmatched.len() > n % 2 {
        ws.exhausted = true;
        return Draft {
            groups,
            leftovers: Vec::new(),
            unplaced: unmatched.into_iter().collect(),
        };
    }

    Draft {
        groups,
        leftovers: unmatched.into_iter().collect(),
        unplaced: Vec::new(),
    }
}

fn greedy_pairs(ws: &Workspace<'_>, unmatched: &mut BTreeSet<usize>, groups: &mut Vec<Vec<usize>>) {
    for edge in ws.allowed_edges(unmatched) {
        if unmatched.contains(&edge.a) && unmatched.contains(&edge.b) {
            unmatched.remove(&edge.a);
            unmatched.remove(&edge.b);
            tracing::debug!(
                "Paired {} and {} (score {:.3})",
                ws.id(edge.a),
                ws.id(edge.b),
                edge.score
            );
            groups.push(vec![edge.a, edge.b]);
        }
    }
}

/// Place a single leftover into the group holding its best-scoring member
fn absorb_by_best_member(ws: &mut Workspace<'_>, groups: &mut [Vec<usize>], left: usize) -> Option<Absorption> {
    let affinity: Vec<f64> = groups
        .iter()
        .map(|g| g.iter().map(|&m| ws.score(left, m)).fold(0.0, f64::max))
        .collect();
    // Ties keep the earlier group
    let best_of = |candidates: Vec<usize>| {
        candidates.into_iter().fold(None, |best: Option<usize>, g| match best {
            Some(b) if affinity[b] >= affinity[g] => Some(b),
            _ => Some(g),
        })
    };

    let compatible: Vec<usize> = (0..groups.len())
        .filter(|&g| ws.compatible(left, &groups[g]))
        .collect();
    let target = match best_of(compatible) {
        Some(g) => g,
        None => {
            let g = best_of((0..groups.len()).collect())?;
            let conflicts = ws.conflicts(left, &groups[g]);
            if !ws.relax(&conflicts) {
                return None;
            }
            g
        }
    };
    let score = affinity[target];

    groups[target].push(left);
    tracing::warn!(
        "Absorbed leftover {} into group {} (best member score {:.3})",
        ws.id(left),
        target,
        score
    );
    Some(Absorption {
        participant: ws.id(left).to_string(),
        group_index: target,
        score,
    })
}

fn build_groups(ws: &mut Workspace<'_>, k: usize) -> Draft {
    let n = ws.scores.len();
    let mut unassigned: BTreeSet<usize> = (0..n).collect();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut stalled: Vec<usize> = Vec::new();

    let mut edges: Vec<Edge> = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for a in 0..n {
        for b in (a + 1)..n {
            edges.push(Edge {
                a,
                b,
                score: ws.score(a, b),
            });
        }
    }
    sort_edges(&mut edges);

    // Edges before the cursor have an assigned endpoint or were blocked when
    // passed; any relaxation rewinds it.
    let mut cursor = 0;

    while unassigned.len() >= k {
        let seed = edges[cursor..].iter().position(|e| {
            unassigned.contains(&e.a) && unassigned.contains(&e.b) && ws.allowed(e.a, e.b)
        });

        let Some(offset) = seed else {
            let Some(pair) = ws.oldest_blocked_among(&unassigned) else {
                break;
            };
            if !ws.relax(&[pair]) {
                break;
            }
            cursor = 0;
            continue;
        };

        cursor += offset;
        let Edge { a, b, .. } = edges[cursor];
        unassigned.remove(&a);
        unassigned.remove(&b);

        let mut group = vec![a, b];
        if grow_group(ws, &mut group, &mut unassigned, k) {
            cursor = 0;
        }

        if group.len() == k {
            tracing::debug!(
                "Formed group {:?} (mean score {:.3})",
                group.iter().map(|&i| ws.id(i)).collect::<Vec<_>>(),
                ws.scores.group_mean(&group)
            );
            groups.push(group);
        } else {
            tracing::warn!(
                "Group seeded by {} and {} stalled at {} of {} members",
                ws.id(a),
                ws.id(b),
                group.len(),
                k
            );
            stalled.extend(group);
        }
    }

    refine_by_swaps(ws, &mut groups);

    let mut leftovers: Vec<usize> = unassigned.into_iter().chain(stalled).collect();
    leftovers.sort_unstable();

    Draft {
        groups,
        leftovers,
        unplaced: Vec::new(),
    }
}

/// Grow `group` towards `k` members; returns true if any pair was relaxed
fn grow_group(ws: &mut Workspace<'_>, group: &mut Vec<usize>, unassigned: &mut BTreeSet<usize>, k: usize) -> bool {
    let mut relaxed_any = false;
    let mut pair_sum = ws.scores.group_mean(group) * pair_count(group.len());

    while group.len() < k {
        let denominator = pair_count(group.len() + 1);
        let mut best: Option<(f64, f64, usize)> = None;
        for &c in unassigned.iter() {
            if !ws.compatible(c, group) {
                continue;
            }
            let added: f64 = group.iter().map(|&m| ws.score(c, m)).sum();
            let mean = (pair_sum + added) / denominator;
            if best.map_or(true, |(bm, _, _)| mean > bm) {
                best = Some((mean, added, c));
            }
        }

        if let Some((_, added, c)) = best {
            unassigned.remove(&c);
            group.push(c);
            pair_sum += added;
            continue;
        }

        // Every remaining candidate conflicts with a member; reintroduce the
        // one whose most recent conflicting meeting is oldest.
        let mut oldest: Option<(u64, usize, usize)> = None;
        for &c in unassigned.iter() {
            let newest = group.iter().filter_map(|&m| ws.blocking(c, m)).max();
            let Some(newest) = newest else {
                continue;
            };
            let count = ws.conflicts(c, group).len();
            let better = match oldest {
                None => true,
                Some((r, cnt, _)) => newest < r || (newest == r && count < cnt),
            };
            if better {
                oldest = Some((newest, count, c));
            }
        }

        let Some((_, _, c)) = oldest else {
            break;
        };
        let conflicts = ws.conflicts(c, group);
        if !ws.relax(&conflicts) {
            break;
        }
        relaxed_any = true;
    }

    relaxed_any
}

#[inline]
fn pair_count(size: usize) -> f64 {
    (size * size.saturating_sub(1) / 2) as f64
}

/// Apply the best improving single swap between two groups until none remains
fn refine_by_swaps(ws: &Workspace<'_>, groups: &mut [Vec<usize>]) {
    if groups.len() < 2 {
        return;
    }

    for _ in 0..MAX_REFINEMENT_PASSES {
        let sums: Vec<f64> = groups
            .iter()
            .map(|g| ws.scores.group_mean(g) * pair_count(g.len()))
            .collect();

        let mut best: Option<(f64, usize, usize, usize, usize)> = None;
        for ga in 0..groups.len() {
            for gb in (ga + 1)..groups.len() {
                let (left, right) = (&groups[ga], &groups[gb]);
                let (pa, pb) = (pair_count(left.len()), pair_count(right.len()));

                for (xa, &a) in left.iter().enumerate() {
                    for (xb, &b) in right.iter().enumerate() {
                        if !compatible_except(ws, b, left, xa) || !compatible_except(ws, a, right, xb) {
                            continue;
                        }
                        let new_left = sums[ga] - sum_except(ws, a, left, xa) + sum_except(ws, b, left, xa);
                        let new_right = sums[gb] - sum_except(ws, b, right, xb) + sum_except(ws, a, right, xb);
                        let gain = (new_left - sums[ga]) / pa + (new_right - sums[gb]) / pb;
                        if gain > SWAP_EPSILON && best.map_or(true, |(bg, ..)| gain > bg) {
                            best = Some((gain, ga, xa, gb, xb));
                        }
                    }
                }
            }
        }

        let Some((gain, ga, xa, gb, xb)) = best else {
            return;
        };
        let (a, b) = (groups[ga][xa], groups[gb][xb]);
        groups[ga][xa] = b;
        groups[gb][xb] = a;
        tracing::debug!(
            "Swapped {} and {} between groups {} and {} (gain {:.4})",
            ws.id(a),
            ws.id(b),
            ga,
            gb,
            gain
        );
    }
}

/// Sum of `candidate`'s scores with every member except position `skip`
fn sum_except(ws: &Workspace<'_>, candidate: usize, members: &[usize], skip: usize) -> f64 {
    members
        .iter()
        .enumerate()
        .filter(|&(x, _)| x != skip)
        .map(|(_, &m)| ws.score(candidate, m))
        .sum()
}

fn compatible_except(ws: &Workspace<'_>, candidate: usize, members: &[usize], skip: usize) -> bool {
    members
        .iter()
        .enumerate()
        .filter(|&(x, _)| x != skip)
        .all(|(_, &m)| ws.allowed(candidate, m))
}

/// Give each leftover to a distinct group, best mean first
fn distribute_to_best_groups(
    ws: &mut Workspace<'_>,
    groups: &mut [Vec<usize>],
    leftovers: Vec<usize>,
) -> (Vec<Absorption>, Vec<usize>) {
    let means: Vec<f64> = groups.iter().map(|g| ws.scores.group_mean(g)).collect();
    let mut rank: Vec<usize> = (0..groups.len()).collect();
    rank.sort_by(|&x, &y| means[y].total_cmp(&means[x]).then(x.cmp(&y)));

    let mut grown = vec![false; groups.len()];
    let mut absorptions = Vec::new();
    let mut unplaced = Vec::new();

    for left in leftovers {
        let open: Vec<usize> = rank.iter().copied().filter(|&g| !grown[g]).collect();
        let Some(&first_open) = open.first() else {
            unplaced.push(left);
            continue;
        };

        let target = match open.iter().copied().find(|&g| ws.compatible(left, &groups[g])) {
            Some(g) => g,
            None => {
                let conflicts = ws.conflicts(left, &groups[first_open]);
                if !ws.relax(&conflicts) {
                    unplaced.push(left);
                    continue;
                }
                first_open
            }
        };

        let members = &groups[target];
        let score = members.iter().map(|&m| ws.score(left, m)).sum::<f64>() / members.len() as f64;
        groups[target].push(left);
        grown[target] = true;

        tracing::warn!(
            "Absorbed leftover {} into group {} (mean affinity {:.3})",
            ws.id(left),
            target,
            score
        );
        absorptions.push(Absorption {
            participant: ws.id(left).to_string(),
            group_index: target,
            score,
        });
    }

    (absorptions, unplaced)
}
