//! Dispatch timestamped events in a reproducible total order.
//!
//! This crate provides the discrete-event kernel that drives a simulation. Every unit of
//! work is an event carrying a virtual timestamp and an insertion sequence number. The
//! `deterministic` module pops events in `(timestamp, sequence)` order and hands each one,
//! fully and synchronously, to a [Handler] before considering the next.
//!
//! # Terminology
//!
//! The runtime is composed of an `Executor` and a `Context`. The `Executor` owns the run loop
//! and the per-timestamp iteration cap. The `Context` is handed to the [Handler] with every
//! event and provides the [Clock], the event queue, the single seeded random source, and
//! the [Metrics] registry.
//!
//! # Status
//!
//! `qosim-runtime` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use prometheus_client::registry::Metric;
use std::fmt::Debug;
use thiserror::Error;

pub mod deterministic;
mod time;
pub use time::SimTime;

/// Prefix for runtime metrics.
const METRICS_PREFIX: &str = "runtime";

/// Errors that can occur when interacting with the runtime.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("out of order scheduling: now={now} requested={requested}")]
    OutOfOrder { now: SimTime, requested: SimTime },
    #[error("stalled at {time}: more than {cap} events dispatched without advancing time")]
    Stalled { time: SimTime, cap: u64 },
    #[error("handler failed: {0}")]
    Handler(String),
}

/// Interface that any event consumer must implement to be driven by the runtime.
pub trait Handler {
    /// The payload dispatched to this handler.
    ///
    /// The `Debug` rendering of each event feeds the determinism auditor, so it must
    /// not depend on anything other than the event's contents.
    type Event: Debug;

    /// Returns whether `event` still targets something that can accept it.
    ///
    /// Events whose target is no longer eligible (for example, a flow that has
    /// already been torn down) are skipped as no-ops rather than dispatched.
    fn is_live(&self, _event: &Self::Event) -> bool {
        true
    }

    /// Apply the side effects of `event`, possibly scheduling follow-up events
    /// through `context`.
    fn handle(
        &mut self,
        context: &mut deterministic::Context<Self::Event>,
        event: Self::Event,
    ) -> Result<(), Error>;
}

/// Interface that provides the current virtual time.
pub trait Clock {
    /// Returns the current virtual time.
    fn current(&self) -> SimTime;
}

/// Interface to register and export metrics.
pub trait Metrics {
    /// Register a metric with the runtime.
    ///
    /// It is not permitted to use `METRICS_PREFIX` as the start of a name.
    fn register<N: Into<String>, H: Into<String>>(&mut self, name: N, help: H, metric: impl Metric);

    /// Encode all metrics into a buffer.
    fn encode(&self) -> String;
}

/// Converts bytes to a lowercase hexadecimal string.
pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[]), "");
        assert_eq!(hex(&[0x00, 0x0f, 0xab, 0xff]), "000fabff");
    }

    #[test]
    fn test_error_messages() {
        let err = Error::OutOfOrder {
            now: SimTime::from_millis(5),
            requested: SimTime::from_millis(3),
        };
        assert_eq!(
            err.to_string(),
            "out of order scheduling: now=5ms requested=3ms"
        );
    }
}
