//! Run a scenario end to end.
//!
//! A [Simulation] owns the cell and every policy, and reacts to [Event]s dispatched by
//! the deterministic runtime. Traffic arrives on its own schedule, a scheduling round
//! runs every grid interval, and the QoS monitor publishes feedback on a slower clock.
//! Everything observable is reported to a [Sink](crate::trace::Sink) as it happens.
//!
//! # Example
//!
//! ```rust
//! use qosim_radio::{config::Config, simulation, trace::Memory};
//!
//! let config = Config::from_yaml(
//!     r#"
//! duration_ms: 50
//! grid: { capacity: 10 }
//! priority_policy: round-robin
//! terminals:
//!   - cqi: 9
//!     bearers:
//!       - qci: 9
//!         packet_size: { kind: constant, value: 100 }
//!         inter_arrival_ms: { kind: constant, value: 5 }
//! "#,
//! )
//! .unwrap();
//! let outcome = simulation::run(&config, Memory::default()).unwrap();
//! assert_eq!(outcome.summary.counts.admitted, 1);
//! ```

use crate::{config::Config, stats::Summary, trace::Sink, BearerId, Error};
use qosim_runtime::{deterministic, Metrics as _, SimTime};
use tracing::info;

mod handler;
pub use handler::Simulation;
mod metrics;

/// Everything that can happen in a simulated cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A bearer asks for admission (first request, retry, or readmission).
    Setup { bearer: BearerId },

    /// The next packet of a bearer's traffic source is due.
    ///
    /// Arrivals of an earlier generation (before the bearer was preempted) are stale.
    Arrival { bearer: BearerId, epoch: u32 },

    /// A transmitted packet reaches its receiver.
    Delivery {
        bearer: BearerId,
        bits: u64,
        arrival: SimTime,
    },

    /// A bearer's activity window ends.
    Release { bearer: BearerId },

    /// Allocate the resource grid.
    Round,

    /// Perturb every terminal's channel quality.
    Channel,

    /// Sample every scheduled bearer against its requirement.
    Monitor,

    /// Try to restore a violated bearer's service by preemption.
    Enforce { bearer: BearerId },
}

impl Event {
    /// The bearer the event targets (none for cell-wide events).
    pub fn bearer(&self) -> Option<BearerId> {
        match self {
            Event::Setup { bearer }
            | Event::Arrival { bearer, .. }
            | Event::Delivery { bearer, .. }
            | Event::Release { bearer }
            | Event::Enforce { bearer } => Some(*bearer),
            Event::Round | Event::Channel | Event::Monitor => None,
        }
    }
}

/// Result of a completed run.
pub struct Outcome<S> {
    pub summary: Summary,

    /// Prometheus text exposition of every counter at the end of the run.
    pub metrics: String,

    pub sink: S,
}

/// Run `config` to completion, reporting every observation to `sink`.
pub fn run<S: Sink>(config: &Config, sink: S) -> Result<Outcome<S>, Error> {
    config.validate()?;
    let mut executor = deterministic::Executor::init(deterministic::Config {
        seed: config.seed,
        max_events_per_instant: config.engine.max_events_per_instant,
    });
    let mut simulation = Simulation::init(executor.context(), config, sink)?;
    let end = executor.run(&mut simulation, SimTime::from_millis(config.duration_ms))?;
    let summary = simulation.summary(end, executor.auditor().state());
    info!(
        policy = %summary.policy,
        admitted = summary.counts.admitted,
        preempted = summary.counts.preempted,
        digest = summary.digest,
        "simulation complete"
    );
    Ok(Outcome {
        summary,
        metrics: executor.context().encode(),
        sink: simulation.into_sink(),
    })
}
