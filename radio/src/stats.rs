//! Aggregate statistics of a finished run.

use crate::{bearer::Bearer, priority::Policy};
use qosim_runtime::SimTime;
use serde::Serialize;

/// Event counts accumulated over a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub admitted: u64,
    pub rejected: u64,
    pub queued: u64,
    pub preempted: u64,
    pub released: u64,
    pub rounds: u64,
    pub exhausted_rounds: u64,
}

/// Per-policy totals of one run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub policy: Policy,

    #[serde(flatten)]
    pub counts: Counts,

    /// Mean over ever-admitted bearers of delivered bits per second of admitted time.
    pub throughput: f64,

    /// Mean delay of delivered packets in milliseconds.
    pub delay: f64,

    /// Dropped bits over bits that were either delivered or dropped.
    pub loss: f64,

    /// Determinism auditor digest at the end of the run.
    pub digest: String,
}

impl Summary {
    /// Summarize `bearers` at `end`.
    pub fn compute<'a>(
        policy: Policy,
        counts: Counts,
        bearers: impl IntoIterator<Item = &'a Bearer>,
        end: SimTime,
        digest: String,
    ) -> Self {
        let mut served = 0u64;
        let mut throughput = 0.0;
        let mut packets = 0u64;
        let mut delay = 0u64;
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for bearer in bearers {
            let totals = &bearer.totals;
            packets += totals.delivered_packets;
            delay += totals.delay;
            delivered += totals.delivered_bits;
            dropped += totals.dropped_bits;

            // Only bearers that were admitted at some point have a service time
            if bearer.admission().is_none() {
                continue;
            }
            served += 1;
            let time = bearer.service_time(end).max(1);
            throughput += totals.delivered_bits as f64 * 1_000.0 / time as f64;
        }
        Self {
            policy,
            counts,
            throughput: ratio(throughput, served as f64),
            delay: ratio(delay as f64, packets as f64),
            loss: ratio(dropped as f64, (delivered + dropped) as f64),
            digest,
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }
    numerator / denominator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bearer::State,
        profile::{ApplicationProfile, Generator},
        BearerId,
    };

    fn bearer(terminal: u32) -> Bearer {
        let profile = ApplicationProfile::constant(9, 100.0, 10.0);
        let requirement = profile.requirement().unwrap();
        let generator = Generator::new(&profile, 0, 0).unwrap();
        Bearer::new(
            BearerId::new(terminal, 0),
            profile,
            requirement,
            generator,
            1_000,
        )
    }

    #[test]
    fn test_empty_run() {
        let summary = Summary::compute(
            Policy::RoundRobin,
            Counts::default(),
            [],
            SimTime::from_millis(100),
            String::new(),
        );
        assert_eq!(summary.throughput, 0.0);
        assert_eq!(summary.delay, 0.0);
        assert_eq!(summary.loss, 0.0);
    }

    #[test]
    fn test_means() {
        let mut fast = bearer(0);
        fast.transition(State::Admitted, SimTime::ZERO);
        fast.set_admission(0);
        fast.totals.delivered_packets = 2;
        fast.totals.delivered_bits = 2_000;
        fast.totals.delay = 10;
        fast.totals.dropped_bits = 1_000;

        let mut slow = bearer(1);
        slow.transition(State::Admitted, SimTime::from_millis(500));
        slow.set_admission(1);
        slow.totals.delivered_packets = 2;
        slow.totals.delivered_bits = 500;
        slow.totals.delay = 30;

        // Never admitted: counted for loss, not for throughput
        let mut refused = bearer(2);
        refused.totals.dropped_bits = 500;

        let summary = Summary::compute(
            Policy::StrictPriority,
            Counts::default(),
            [&fast, &slow, &refused],
            SimTime::from_millis(1_000),
            "digest".into(),
        );
        assert_eq!(summary.throughput, (2_000.0 + 1_000.0) / 2.0);
        assert_eq!(summary.delay, 10.0);
        assert_eq!(summary.loss, 1_500.0 / 4_000.0);
        assert_eq!(summary.digest, "digest");
    }

    #[test]
    fn test_json_flattens_counts() {
        let summary = Summary::compute(
            Policy::DeadlineAware,
            Counts {
                admitted: 3,
                ..Counts::default()
            },
            [],
            SimTime::ZERO,
            "abc".into(),
        );
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["policy"], "deadline-aware");
        assert_eq!(json["admitted"], 3);
        assert_eq!(json["digest"], "abc");
    }
}
