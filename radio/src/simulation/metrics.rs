use crate::stats::Counts;
use prometheus_client::metrics::counter::Counter;
use qosim_runtime::{deterministic::Context, Metrics as RuntimeMetrics};
use std::fmt::Debug;

/// Metrics for the [`Simulation`](super::Simulation)
#[derive(Default)]
pub struct Metrics {
    /// Number of admissions (including readmissions)
    pub admitted: Counter,
    /// Number of rejected admission requests
    pub rejected: Counter,
    /// Number of deferred admission requests
    pub queued: Counter,
    /// Number of bearers evicted by preemption
    pub preempted: Counter,
    /// Number of bearers released
    pub released: Counter,
    /// Number of scheduling rounds
    pub rounds: Counter,
    /// Number of rounds in which reservations starved the top-ranked bearer
    pub exhausted_rounds: Counter,
    /// Number of resource units granted
    pub allocated_units: Counter,
    /// Number of packets delivered
    pub packets_delivered: Counter,
    /// Number of packets dropped
    pub packets_dropped: Counter,
    /// Number of QoS violation reports
    pub violations: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: Debug>(context: &mut Context<E>) -> Self {
        let metrics = Metrics::default();
        context.register("admitted", "Number of admissions", metrics.admitted.clone());
        context.register(
            "rejected",
            "Number of rejected admission requests",
            metrics.rejected.clone(),
        );
        context.register(
            "queued",
            "Number of deferred admission requests",
            metrics.queued.clone(),
        );
        context.register(
            "preempted",
            "Number of bearers evicted by preemption",
            metrics.preempted.clone(),
        );
        context.register("released", "Number of bearers released", metrics.released.clone());
        context.register("rounds", "Number of scheduling rounds", metrics.rounds.clone());
        context.register(
            "exhausted_rounds",
            "Number of rounds in which reservations starved the top-ranked bearer",
            metrics.exhausted_rounds.clone(),
        );
        context.register(
            "allocated_units",
            "Number of resource units granted",
            metrics.allocated_units.clone(),
        );
        context.register(
            "packets_delivered",
            "Number of packets delivered",
            metrics.packets_delivered.clone(),
        );
        context.register(
            "packets_dropped",
            "Number of packets dropped",
            metrics.packets_dropped.clone(),
        );
        context.register(
            "violations",
            "Number of QoS violation reports",
            metrics.violations.clone(),
        );
        metrics
    }

    /// Snapshot of the counters reported in a summary.
    pub fn counts(&self) -> Counts {
        Counts {
            admitted: self.admitted.get(),
            rejected: self.rejected.get(),
            queued: self.queued.get(),
            preempted: self.preempted.get(),
            released: self.released.get(),
            rounds: self.rounds.get(),
            exhausted_rounds: self.exhausted_rounds.get(),
        }
    }
}
