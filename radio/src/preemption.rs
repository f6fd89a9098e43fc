//! Victim selection when demand cannot be met within capacity.
//!
//! [select_victims] only considers bearers that score strictly lower than the bearer
//! they make room for. It picks the smallest set whose freed units cover the need, and
//! among sets of that size the one that evicts the lowest scores first. When even every
//! eligible bearer together would not free enough, it reports the residual deficit and
//! evicts nobody.

use crate::{
    bearer::{Bearer, State},
    priority::{AllocationRetention, Candidate as Ranked, Policy, PriorityPolicy, Score},
    qos::Feedback,
    terminal::Cell,
    BearerId,
};
use qosim_runtime::SimTime;
use serde::Deserialize;
use std::cmp::Reverse;

/// A bearer that could be evicted and the units evicting it would free.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Candidate {
    pub bearer: BearerId,
    pub score: Score,
    pub units: u32,
}

/// Result of a victim search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    /// Bearers to evict, lowest score first.
    Victims(Vec<BearerId>),

    /// Evicting every eligible bearer would still leave `missing` units short.
    Deficit { missing: u32 },
}

/// Choose the bearers to evict so that `needed` units are freed for a bearer scoring `requester`.
pub fn select_victims(candidates: &[Candidate], needed: u32, requester: Score) -> Selection {
    if needed == 0 {
        return Selection::Victims(Vec::new());
    }
    let needed = needed as u64;

    // Only strictly lower scores that actually free something are eligible
    let mut eligible: Vec<Candidate> = candidates
        .iter()
        .filter(|candidate| candidate.score < requester && candidate.units > 0)
        .copied()
        .collect();

    // Smallest cardinality: take the largest contributors first
    let mut sizes: Vec<u64> = eligible.iter().map(|c| c.units as u64).collect();
    sizes.sort_unstable_by_key(|units| Reverse(*units));
    let mut freed = 0u64;
    let mut size = None;
    for (index, units) in sizes.iter().enumerate() {
        freed += units;
        if freed >= needed {
            size = Some(index + 1);
            break;
        }
    }
    let Some(size) = size else {
        return Selection::Deficit {
            missing: (needed - freed) as u32,
        };
    };

    // Among sets of that size, prefer the lowest scores (then lowest identities)
    eligible.sort_by(|a, b| a.score.cmp(&b.score).then_with(|| a.bearer.cmp(&b.bearer)));
    let mut chosen = Vec::with_capacity(size);
    let found = search(&eligible, 0, size, needed, 0, &mut chosen);
    assert!(found, "victim set of size {size} must exist");
    Selection::Victims(chosen.into_iter().map(|index| eligible[index].bearer).collect())
}

/// Depth-first search for the first set of `size` indices (in order) freeing `needed`.
fn search(
    order: &[Candidate],
    start: usize,
    size: usize,
    needed: u64,
    freed: u64,
    chosen: &mut Vec<usize>,
) -> bool {
    if chosen.len() == size {
        return freed >= needed;
    }
    let slots = size - chosen.len();
    for index in start..order.len() {
        if order.len() - index < slots {
            break;
        }

        // The best completion only shrinks as the start moves right
        if freed + best(&order[index..], slots) < needed {
            break;
        }
        chosen.push(index);
        if search(
            order,
            index + 1,
            size,
            needed,
            freed + order[index].units as u64,
            chosen,
        ) {
            return true;
        }
        chosen.pop();
    }
    false
}

/// Largest total of `slots` entries from `rest`.
fn best(rest: &[Candidate], slots: usize) -> u64 {
    let mut units: Vec<u64> = rest.iter().map(|c| c.units as u64).collect();
    units.sort_unstable_by_key(|units| Reverse(*units));
    units.into_iter().take(slots).sum()
}

/// Re-admission of preempted bearers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct Readmission {
    /// Milliseconds between eviction (or a failed attempt) and the next attempt.
    pub interval_ms: u64,

    /// Attempts before the bearer is released.
    pub attempts: u32,
}

/// How requesters and victims are scored for eviction.
///
/// Any scheduling policy can be reused, or the allocation and retention priority of
/// each bearer's profile can decide on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ranking {
    RoundRobin,
    ProportionalFair,
    StrictPriority,
    DeadlineAware,
    AllocationRetention,
}

impl Ranking {
    /// Instantiate the ranking for rounds of `interval` milliseconds.
    pub fn build(self, interval: u64) -> Box<dyn PriorityPolicy> {
        let policy = match self {
            Ranking::RoundRobin => Policy::RoundRobin,
            Ranking::ProportionalFair => Policy::ProportionalFair,
            Ranking::StrictPriority => Policy::StrictPriority,
            Ranking::DeadlineAware => Policy::DeadlineAware,
            Ranking::AllocationRetention => return Box::new(AllocationRetention),
        };
        policy.build(interval)
    }
}

/// Scores bearers for eviction decisions with a dedicated ranking policy.
pub struct Preemption {
    ranking: Box<dyn PriorityPolicy>,
}

impl Preemption {
    pub fn new(ranking: Box<dyn PriorityPolicy>) -> Self {
        Self { ranking }
    }

    /// Score `bearer` with the eviction ranking.
    pub fn score(&self, cell: &Cell, feedback: &Feedback, bearer: &Bearer, now: SimTime) -> Score {
        let candidate = Ranked {
            bearer,
            efficiency: cell.efficiency(bearer.id()),
        };
        self.ranking
            .rank(&candidate, feedback.sample(&bearer.id()), now)
    }

    /// Select victims among `pool` (bearer and the units evicting it frees) on behalf of `requester`.
    ///
    /// Only active, preemptible bearers other than the requester are considered.
    pub fn select(
        &self,
        cell: &Cell,
        feedback: &Feedback,
        requester: &Bearer,
        pool: impl IntoIterator<Item = (BearerId, u32)>,
        needed: u32,
        now: SimTime,
    ) -> Selection {
        let candidates: Vec<Candidate> = pool
            .into_iter()
            .filter_map(|(id, units)| {
                let bearer = cell.bearer(id)?;
                let eligible = id != requester.id()
                    && bearer.state() == State::Active
                    && bearer.profile().preemptible;
                eligible.then(|| Candidate {
                    bearer: id,
                    score: self.score(cell, feedback, bearer, now),
                    units,
                })
            })
            .collect();
        let score = self.score(cell, feedback, requester, now);
        select_victims(&candidates, needed, score)
    }
}
