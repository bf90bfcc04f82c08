// Property tests for the matching engine over generated snapshots and histories

use coffee_match::core::{eligible_snapshot, BuildError, HistoryTracker, MatchBuilder, MatchPlan, ScoreMatrix};
use coffee_match::models::{
    LeftoverPolicy, MatchHistoryEntry, MeetingLength, PairKey, Participant, ScoringWeights,
};
use proptest::prelude::*;
use std::collections::HashSet;

const TOPICS: [&str; 6] = ["rust", "coffee", "books", "hiking", "chess", "music"];
const SLOTS: [&str; 5] = ["mon-am", "tue-pm", "wed-am", "thu-pm", "fri-am"];
const ROUND_INDEX: u64 = 8;

#[derive(Debug, Clone)]
struct Case {
    participants: Vec<Participant>,
    history: Vec<MatchHistoryEntry>,
    group_size: usize,
    lookback: u64,
    relax: u32,
    policy: LeftoverPolicy,
}

impl Case {
    fn tracker(&self) -> HistoryTracker {
        HistoryTracker::from_entries(self.history.clone())
    }

    fn build(&self, participants: Vec<Participant>) -> Result<MatchPlan, BuildError> {
        let snapshot = eligible_snapshot(participants);
        let scores = ScoreMatrix::compute(&snapshot.participants, &ScoringWeights::default());
        let blocked = self.tracker().blocked_pairs(&snapshot.ids(), ROUND_INDEX, self.lookback);
        MatchBuilder::new(self.group_size, self.relax, self.policy).build(&scores, &blocked)
    }

    fn ids(&self) -> HashSet<String> {
        self.participants.iter().map(|p| p.id.clone()).collect()
    }
}

fn participant(index: usize, topics: Vec<usize>, slots: Vec<usize>, length: usize) -> Participant {
    let lengths = [
        MeetingLength::Fifteen,
        MeetingLength::Thirty,
        MeetingLength::FortyFive,
        MeetingLength::Sixty,
    ];
    Participant::new(format!("user-{:02}", index))
        .with_topics(topics.into_iter().map(|t| TOPICS[t]))
        .with_availability(slots.into_iter().map(|s| SLOTS[s]))
        .with_meeting_length(lengths[length])
}

fn case_strategy() -> impl Strategy<Value = Case> {
    let people = prop::collection::vec(
        (
            prop::collection::vec(0..TOPICS.len(), 0..4),
            prop::collection::vec(0..SLOTS.len(), 0..3),
            0..4usize,
        ),
        0..24,
    );
    let meetings = prop::collection::vec((0..24usize, 0..24usize, 1..ROUND_INDEX), 0..40);
    let policy = prop_oneof![Just(LeftoverPolicy::Absorb), Just(LeftoverPolicy::CarryForward)];

    (people, meetings, 2..6usize, 0..4u64, 0..6u32, policy).prop_map(
        |(people, meetings, group_size, lookback, relax, policy)| {
            let participants: Vec<Participant> = people
                .into_iter()
                .enumerate()
                .map(|(i, (topics, slots, length))| participant(i, topics, slots, length))
                .collect();

            let n = participants.len();
            let history = meetings
                .into_iter()
                .filter(|&(a, b, _)| n > 1 && a % n != b % n)
                .map(|(a, b, round_index)| MatchHistoryEntry {
                    pair_key: PairKey::new(participants[a % n].id.clone(), participants[b % n].id.clone()),
                    round_id: format!("round-{}", round_index),
                    round_index,
                })
                .collect();

            Case {
                participants,
                history,
                group_size,
                lookback,
                relax,
                policy,
            }
        },
    )
}

proptest! {
    #[test]
    fn prop_every_participant_placed_exactly_once(case in case_strategy()) {
        if let Ok(plan) = case.build(case.participants.clone()) {
            let mut seen = HashSet::new();
            for id in plan.groups.iter().flat_map(|g| &g.members).chain(&plan.carried_over) {
                prop_assert!(seen.insert(id.clone()), "{} placed twice", id);
            }
            prop_assert_eq!(seen, case.ids());
        }
    }

    #[test]
    fn prop_group_sizes_stay_within_one_of_target(case in case_strategy()) {
        if let Ok(plan) = case.build(case.participants.clone()) {
            for group in &plan.groups {
                let size = group.members.len();
                prop_assert!(
                    size == case.group_size || size == case.group_size + 1,
                    "group of {} for target {}",
                    size,
                    case.group_size
                );
            }
        }
    }

    #[test]
    fn prop_input_order_does_not_change_result(case in case_strategy()) {
        let mut reversed = case.participants.clone();
        reversed.reverse();
        prop_assert_eq!(case.build(case.participants.clone()), case.build(reversed));
    }

    #[test]
    fn prop_blocked_pairs_only_meet_through_logged_relaxation(case in case_strategy()) {
        let tracker = case.tracker();
        if let Ok(plan) = case.build(case.participants.clone()) {
            prop_assert!(plan.relaxations.len() <= case.relax as usize);

            let relaxed: HashSet<PairKey> = plan
                .relaxations
                .iter()
                .map(|r| PairKey::new(r.participant_a.clone(), r.participant_b.clone()))
                .collect();

            for group in &plan.groups {
                for (x, a) in group.members.iter().enumerate() {
                    for b in &group.members[x + 1..] {
                        if tracker.is_disallowed(a, b, ROUND_INDEX, case.lookback) {
                            prop_assert!(
                                relaxed.contains(&PairKey::new(a.clone(), b.clone())),
                                "{} and {} grouped without a logged relaxation",
                                a,
                                b
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn prop_infeasible_reports_real_unplaced_participants(case in case_strategy()) {
        match case.build(case.participants.clone()) {
            Ok(_) => {}
            Err(BuildError::Infeasible { unmatched, relaxation_steps, .. }) => {
                prop_assert!(!unmatched.is_empty());
                prop_assert!(relaxation_steps <= case.relax);
                let ids = case.ids();
                prop_assert!(unmatched.iter().all(|id| ids.contains(id)));
            }
            Err(other) => prop_assert!(false, "unexpected error: {:?}", other),
        }
    }
}
