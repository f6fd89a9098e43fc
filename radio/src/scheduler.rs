//! Per-round allocation of the resource grid.
//!
//! Each round, bearers that are admitted (or active) and have pending traffic become
//! [Demand]s, ranked by the configured [PriorityPolicy]. [plan] then grants resource
//! units in two passes:
//!
//! 1. Guaranteed: in rank order, each guaranteed-rate bearer receives up to its
//!    reservation (sized at the channel model's worst-case efficiency).
//! 2. Excess: in rank order, the remaining units go greedily to whatever demand is left,
//!    bounded by each bearer's maximum-rate cap.
//!
//! If the top-ranked bearer is left short while units were committed to other bearers'
//! reservations, the plan carries an [Exhaustion] for preemption to act on. Demand that
//! does not fit stays queued for the next round.

use crate::{
    amc::{round_bits, units, ChannelModel},
    priority::{rank_order, Candidate, PriorityPolicy, Score},
    qos::{Feedback, Requirement},
    terminal::Cell,
    BearerId,
};
use qosim_runtime::SimTime;
use serde::{Deserialize, Serialize};

/// What happens to traffic that does not fit in a round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Overflow {
    /// Keep every pending bit for the next round.
    #[default]
    CarryOver,

    /// Before each round, drop packets whose delay budget has elapsed.
    DropExpired,
}

/// One bearer's claim on a round.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Demand {
    pub bearer: BearerId,
    pub score: Score,

    /// Units needed to clear the backlog.
    pub units: u32,

    /// Most units the bearer may receive (maximum-rate cap).
    pub cap: u32,

    /// Units reserved for the bearer's guaranteed rate.
    pub reserved: u32,

    /// Bits per unit on the bearer's current channel.
    pub efficiency: u32,
}

/// Units granted to one bearer in a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Grant {
    pub bearer: BearerId,
    pub units: u32,

    /// Portion of `units` granted in the guaranteed pass.
    pub guaranteed: u32,
}

/// The top-ranked bearer could not be fully served because of others' reservations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Exhaustion {
    pub bearer: BearerId,

    /// Units the bearer is missing that reservations are holding.
    pub deficit: u32,
}

/// Allocation for one round, in rank order (bearers granted nothing are omitted).
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    pub grants: Vec<Grant>,
    pub used: u32,
    pub exhaustion: Option<Exhaustion>,
}

impl Plan {
    /// Units granted to `bearer`.
    pub fn granted(&self, bearer: BearerId) -> u32 {
        self.grants
            .iter()
            .find(|grant| grant.bearer == bearer)
            .map_or(0, |grant| grant.units)
    }

    /// Verify the grid is not oversubscribed.
    ///
    /// # Panics
    ///
    /// Panics if the grants sum to more than `capacity`.
    pub fn assert_within(&self, capacity: u32) {
        let total: u64 = self.grants.iter().map(|grant| grant.units as u64).sum();
        assert!(
            total <= capacity as u64 && total == self.used as u64,
            "resource grid oversubscribed: granted {total} of {capacity} units"
        );
    }
}

/// Allocate `capacity` units among `ranked` demands (already in rank order).
pub fn plan(capacity: u32, ranked: &[Demand]) -> Plan {
    let mut remaining = capacity;
    let mut grants: Vec<Grant> = ranked
        .iter()
        .map(|demand| Grant {
            bearer: demand.bearer,
            units: 0,
            guaranteed: 0,
        })
        .collect();

    // Guaranteed pass
    for (demand, grant) in ranked.iter().zip(grants.iter_mut()) {
        let units = demand
            .reserved
            .min(demand.units)
            .min(demand.cap)
            .min(remaining);
        grant.units = units;
        grant.guaranteed = units;
        remaining -= units;
    }

    // Excess pass
    for (demand, grant) in ranked.iter().zip(grants.iter_mut()) {
        if remaining == 0 {
            break;
        }
        let wanted = demand.units.min(demand.cap).saturating_sub(grant.units);
        let extra = wanted.min(remaining);
        grant.units += extra;
        remaining -= extra;
    }

    // Check whether reservations starved the top-ranked bearer
    let exhaustion = match (ranked.first(), grants.first()) {
        (Some(top), Some(grant)) => {
            let wanted = top.units.min(top.cap).min(capacity);
            let held: u32 = grants[1..].iter().map(|grant| grant.guaranteed).sum();
            (grant.units < wanted && held > 0).then(|| Exhaustion {
                bearer: top.bearer,
                deficit: (wanted - grant.units).min(held),
            })
        }
        _ => None,
    };

    grants.retain(|grant| grant.units > 0);
    Plan {
        grants,
        used: capacity - remaining,
        exhaustion,
    }
}

/// Units reserved each round for `requirement`'s guaranteed rate.
pub fn reservation(requirement: &Requirement, channel: &ChannelModel, interval: u64) -> u32 {
    if !requirement.is_guaranteed() {
        return 0;
    }
    let bits = round_bits(requirement.guaranteed_bitrate, interval);
    clamp(units(bits, channel.worst_case()))
}

/// Most units per round allowed by `requirement`'s maximum rate at `efficiency`.
pub fn cap(requirement: &Requirement, efficiency: u32, interval: u64) -> u32 {
    match requirement.max_bitrate {
        None => u32::MAX,
        Some(rate) => clamp(round_bits(rate, interval) / efficiency.max(1) as u64).max(1),
    }
}

fn clamp(units: u64) -> u32 {
    units.min(u32::MAX as u64) as u32
}

/// Ranks bearers and plans rounds over a fixed-capacity grid.
pub struct Scheduler {
    capacity: u32,
    interval: u64,
    policy: Box<dyn PriorityPolicy>,
    overflow: Overflow,
}

impl Scheduler {
    pub fn new(
        capacity: u32,
        interval: u64,
        policy: Box<dyn PriorityPolicy>,
        overflow: Overflow,
    ) -> Self {
        Self {
            capacity,
            interval,
            policy,
            overflow,
        }
    }

    /// Resource units per round.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Round interval in milliseconds.
    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn overflow(&self) -> Overflow {
        self.overflow
    }

    /// Collect and rank every bearer with a claim on this round.
    pub fn demands(&self, cell: &Cell, feedback: &Feedback, now: SimTime) -> Vec<Demand> {
        let mut demands: Vec<Demand> = cell
            .bearers()
            .filter(|bearer| bearer.is_scheduled() && bearer.queue().pending() > 0)
            .map(|bearer| {
                let efficiency = cell.efficiency(bearer.id());
                let candidate = Candidate { bearer, efficiency };
                let requirement = bearer.requirement();
                Demand {
                    bearer: bearer.id(),
                    score: self
                        .policy
                        .rank(&candidate, feedback.sample(&bearer.id()), now),
                    units: clamp(units(bearer.queue().pending(), efficiency)),
                    cap: cap(requirement, efficiency, self.interval),
                    reserved: reservation(requirement, cell.channel(), self.interval),
                    efficiency,
                }
            })
            .collect();
        demands.sort_by(|a, b| rank_order((a.bearer, a.score), (b.bearer, b.score)));
        demands
    }

    /// Plan a round over `demands` (in rank order).
    pub fn plan(&self, demands: &[Demand]) -> Plan {
        plan(self.capacity, demands)
    }
}
