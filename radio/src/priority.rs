//! Pluggable ranking of bearers competing for a scheduling round.
//!
//! Every policy implements [PriorityPolicy::rank], a pure function of the candidate, its
//! latest QoS sample, and the current time. The scheduler sorts candidates by descending
//! [Score], breaking ties by ascending [BearerId].

use crate::{bearer::Bearer, qos::Sample, BearerId};
use qosim_runtime::SimTime;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt, str::FromStr};

/// Floor on the remaining delay budget (milliseconds) so an expired packet ranks high but finite.
const MIN_BUDGET: f64 = 0.001;

/// Floor on the achieved rate (bits per second) so a starved bearer ranks high but finite.
const MIN_RATE: f64 = 1.0;

/// Number of priority levels in the QoS class table.
const LEVELS: f64 = 10.0;

/// One past the least important allocation and retention priority.
const ARP_LEVELS: f64 = 16.0;

/// An orderable ranking value (higher is served first).
///
/// Components compare with [f64::total_cmp], so the order is total even for the
/// infinite scores of never-served bearers.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Score {
    pub primary: f64,
    pub secondary: f64,
}

impl Score {
    pub const fn new(primary: f64, secondary: f64) -> Self {
        Self { primary, secondary }
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.primary
            .total_cmp(&other.primary)
            .then_with(|| self.secondary.total_cmp(&other.secondary))
    }
}

/// Scheduling order: descending score, then ascending identity.
pub fn rank_order(a: (BearerId, Score), b: (BearerId, Score)) -> Ordering {
    b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

/// A bearer under consideration, with the channel efficiency it would be served at.
pub struct Candidate<'a> {
    pub bearer: &'a Bearer,

    /// Bits per resource unit at the terminal's current channel quality.
    pub efficiency: u32,
}

/// Ranks candidates for a scheduling round.
pub trait PriorityPolicy {
    fn rank(&self, candidate: &Candidate<'_>, sample: Option<&Sample>, now: SimTime) -> Score;
}

/// Serves the bearer that has waited longest since its last grant.
///
/// Never-served bearers come first. Among bearers served in the same round, the one
/// granted earlier in that round ranks higher, which rotates service like a pointer.
pub struct RoundRobin;

impl PriorityPolicy for RoundRobin {
    fn rank(&self, candidate: &Candidate<'_>, _: Option<&Sample>, now: SimTime) -> Score {
        match candidate.bearer.last_served() {
            None => Score::new(f64::INFINITY, 0.0),
            Some((time, position)) => Score::new(now.since(time) as f64, -(position as f64)),
        }
    }
}

/// Ratio of the rate a bearer needs to the rate it has recently achieved.
pub struct ProportionalFair {
    /// Round interval in milliseconds.
    pub interval: u64,
}

impl PriorityPolicy for ProportionalFair {
    fn rank(&self, candidate: &Candidate<'_>, _: Option<&Sample>, _: SimTime) -> Score {
        let requirement = candidate.bearer.requirement();
        let required = if requirement.is_guaranteed() {
            requirement.guaranteed_bitrate as f64
        } else {
            // What a single unit per round would carry on the current channel
            candidate.efficiency as f64 * 1_000.0 / self.interval.max(1) as f64
        };
        let achieved = candidate.bearer.average_rate().max(MIN_RATE);
        Score::new(required / achieved, 0.0)
    }
}

/// QoS class priority level, earliest admission first within a level.
pub struct StrictPriority;

impl PriorityPolicy for StrictPriority {
    fn rank(&self, candidate: &Candidate<'_>, _: Option<&Sample>, _: SimTime) -> Score {
        let level = candidate.bearer.requirement().priority() as f64;
        let admission = candidate.bearer.admission().unwrap_or(u64::MAX) as f64;
        Score::new(LEVELS - level, -admission)
    }
}

/// Allocation and retention priority of the bearer's profile.
///
/// Bearers sharing a level score equally, so none of them can evict another.
pub struct AllocationRetention;

impl PriorityPolicy for AllocationRetention {
    fn rank(&self, candidate: &Candidate<'_>, _: Option<&Sample>, _: SimTime) -> Score {
        Score::new(ARP_LEVELS - candidate.bearer.profile().arp as f64, 0.0)
    }
}

/// Inverse of the delay budget left to the oldest undelivered packet.
pub struct DeadlineAware;

impl PriorityPolicy for DeadlineAware {
    fn rank(&self, candidate: &Candidate<'_>, _: Option<&Sample>, now: SimTime) -> Score {
        match candidate.bearer.queue().oldest() {
            None => Score::new(0.0, 0.0),
            Some(packet) => Score::new(1.0 / packet.budget_left(now).max(MIN_BUDGET), 0.0),
        }
    }
}

/// Selector for a [PriorityPolicy].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    RoundRobin,
    ProportionalFair,
    StrictPriority,
    DeadlineAware,
}

impl Policy {
    pub const ALL: [Policy; 4] = [
        Policy::RoundRobin,
        Policy::ProportionalFair,
        Policy::StrictPriority,
        Policy::DeadlineAware,
    ];

    /// Instantiate the policy for rounds of `interval` milliseconds.
    pub fn build(self, interval: u64) -> Box<dyn PriorityPolicy> {
        match self {
            Policy::RoundRobin => Box::new(RoundRobin),
            Policy::ProportionalFair => Box::new(ProportionalFair { interval }),
            Policy::StrictPriority => Box::new(StrictPriority),
            Policy::DeadlineAware => Box::new(DeadlineAware),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Policy::RoundRobin => "round-robin",
            Policy::ProportionalFair => "proportional-fair",
            Policy::StrictPriority => "strict-priority",
            Policy::DeadlineAware => "deadline-aware",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Policy::ALL
            .into_iter()
            .find(|policy| policy.name() == s)
            .ok_or_else(|| format!("unknown priority policy: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bearer::State,
        profile::{ApplicationProfile, Generator},
    };
    use test_case::test_case;

    fn bearer(index: u16, qci: u8, guaranteed_bitrate: u64) -> Bearer {
        let mut profile = ApplicationProfile::constant(qci, 100.0, 10.0);
        profile.guaranteed_bitrate = guaranteed_bitrate;
        with_profile(index, profile)
    }

    fn with_profile(index: u16, profile: ApplicationProfile) -> Bearer {
        let requirement = profile.requirement().unwrap();
        let generator = Generator::new(&profile, 0, 0).unwrap();
        Bearer::new(
            BearerId::new(0, index),
            profile,
            requirement,
            generator,
            100_000,
        )
    }

    fn at(millis: u64) -> SimTime {
        SimTime::from_millis(millis)
    }

    fn rank(policy: &dyn PriorityPolicy, bearer: &Bearer, now: u64) -> Score {
        let candidate = Candidate {
            bearer,
            efficiency: 100,
        };
        policy.rank(&candidate, None, at(now))
    }

    #[test]
    fn test_score_order() {
        assert!(Score::new(2.0, 0.0) > Score::new(1.0, 5.0));
        assert!(Score::new(1.0, 1.0) > Score::new(1.0, 0.0));
        assert!(Score::new(f64::INFINITY, 0.0) > Score::new(f64::MAX, 0.0));
        assert_eq!(Score::new(3.0, 0.0), Score::new(3.0, 0.0));
    }

    #[test]
    fn test_rank_order_ties_by_identity() {
        let mut ranked = vec![
            (BearerId::new(2, 0), Score::new(1.0, 0.0)),
            (BearerId::new(0, 0), Score::new(1.0, 0.0)),
            (BearerId::new(1, 0), Score::new(5.0, 0.0)),
        ];
        ranked.sort_by(|a, b| rank_order(*a, *b));
        let ids: Vec<_> = ranked.iter().map(|(id, _)| *id).collect();
        assert_eq!(
            ids,
            vec![BearerId::new(1, 0), BearerId::new(0, 0), BearerId::new(2, 0)]
        );
    }

    #[test]
    fn test_round_robin() {
        let mut never = bearer(0, 9, 0);
        let mut early = bearer(1, 9, 0);
        let mut late = bearer(2, 9, 0);
        early.served(at(10), 0, 1);
        late.served(at(10), 1, 1);

        let policy = RoundRobin;
        assert_eq!(rank(&policy, &never, 20).primary, f64::INFINITY);
        assert!(rank(&policy, &early, 20) > rank(&policy, &late, 20));

        // Served more recently ranks lower
        never.served(at(15), 0, 1);
        assert!(rank(&policy, &early, 20) > rank(&policy, &never, 20));
        late.served(at(19), 0, 1);
        assert!(rank(&policy, &never, 20) > rank(&policy, &late, 20));
    }

    #[test]
    fn test_proportional_fair() {
        let policy = ProportionalFair { interval: 1 };
        let mut starved = bearer(0, 9, 0);
        let mut fed = bearer(1, 9, 0);
        fed.update_rate(10_000, 1);

        // Zero achieved rate is floored rather than dividing by zero
        assert_eq!(rank(&policy, &starved, 0).primary, 100_000.0);
        assert!(rank(&policy, &starved, 0) > rank(&policy, &fed, 0));

        starved.update_rate(100_000, 1);
        assert!(rank(&policy, &fed, 0) > rank(&policy, &starved, 0));

        // Guaranteed bearers use their guaranteed rate
        let guaranteed = bearer(2, 1, 64_000);
        assert_eq!(rank(&policy, &guaranteed, 0).primary, 64_000.0);
    }

    #[test]
    fn test_strict_priority() {
        let mut voice = bearer(0, 1, 0);
        let mut first = bearer(1, 9, 0);
        let mut second = bearer(2, 9, 0);
        for (sequence, bearer) in [&mut voice, &mut first, &mut second].into_iter().enumerate() {
            bearer.transition(State::Admitted, at(0));
            bearer.set_admission(sequence as u64);
        }

        let policy = StrictPriority;
        assert!(rank(&policy, &voice, 0) > rank(&policy, &first, 0));
        assert!(rank(&policy, &first, 0) > rank(&policy, &second, 0));
        assert_eq!(rank(&policy, &voice, 0).primary, 8.0);
    }

    #[test]
    fn test_allocation_retention() {
        let arp = |index, qci, arp| {
            let mut profile = ApplicationProfile::constant(qci, 100.0, 10.0);
            profile.arp = arp;
            with_profile(index, profile)
        };

        // The class priority level plays no part
        let important = arp(0, 9, 2);
        let voice = arp(1, 1, 9);
        let peer = arp(2, 5, 9);
        let policy = AllocationRetention;
        assert_eq!(rank(&policy, &important, 0).primary, 14.0);
        assert!(rank(&policy, &important, 0) > rank(&policy, &voice, 0));
        assert_eq!(rank(&policy, &voice, 0), rank(&policy, &peer, 0));
    }

    #[test]
    fn test_deadline_aware() {
        let policy = DeadlineAware;
        let mut bearer = bearer(0, 3, 0);
        assert_eq!(rank(&policy, &bearer, 0), Score::new(0.0, 0.0));

        let packet = bearer.next_packet(at(0));
        bearer.queue_mut().push(packet).unwrap();
        assert_eq!(rank(&policy, &bearer, 40).primary, 0.1);

        // Past the deadline the score is capped
        assert_eq!(rank(&policy, &bearer, 80).primary, 1.0 / MIN_BUDGET);
    }

    #[test_case("round-robin", Policy::RoundRobin; "round robin")]
    #[test_case("proportional-fair", Policy::ProportionalFair; "proportional fair")]
    #[test_case("strict-priority", Policy::StrictPriority; "strict priority")]
    #[test_case("deadline-aware", Policy::DeadlineAware; "deadline aware")]
    fn test_policy_names(name: &str, policy: Policy) {
        assert_eq!(name.parse::<Policy>().unwrap(), policy);
        assert_eq!(policy.to_string(), name);
    }

    #[test]
    fn test_unknown_policy() {
        assert!("fifo".parse::<Policy>().is_err());
    }
}
