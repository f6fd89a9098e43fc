//! Evaluate scheduling, admission, and preemption policies for a simulated cell.
//!
//! A base station shares a finite resource grid among the bearers (traffic flows) of its
//! terminals. Each scheduling round ranks the bearers with a pluggable [priority] policy,
//! converts their backlog into resource units with the [amc] channel model, and grants
//! units in rank order. New bearers pass through [access] control, [preemption] frees
//! room for more important demand, and the [qos] monitor closes the loop by feeding
//! windowed throughput, delay, and loss back into both.
//!
//! Everything runs on top of the deterministic event kernel in `qosim-runtime`: the
//! [simulation] module implements its `Handler` and turns a scenario [config] into a
//! stream of observation [trace] records and an aggregate [stats] summary.
//!
//! # Status
//!
//! `qosim-radio` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub mod access;
pub mod amc;
pub mod bearer;
pub mod config;
pub mod packet;
pub mod preemption;
pub mod priority;
pub mod profile;
pub mod qos;
pub mod scheduler;
pub mod simulation;
pub mod stats;
pub mod terminal;
pub mod trace;

/// Errors that can occur when building or running a simulation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid capacity: grid must offer at least one resource unit")]
    InvalidCapacity,
    #[error("invalid duration: must be positive")]
    InvalidDuration,
    #[error("invalid engine: max_events_per_instant must be positive")]
    InvalidEventCap,
    #[error("invalid interval: {0} must be positive")]
    InvalidInterval(&'static str),
    #[error("invalid distribution for {field}: {reason}")]
    InvalidDistribution { field: &'static str, reason: String },
    #[error("invalid QoS class identifier: {0}")]
    InvalidQci(u8),
    #[error("invalid allocation and retention priority: {0}")]
    InvalidArp(u8),
    #[error("invalid channel table: {0}")]
    InvalidChannelTable(&'static str),
    #[error("invalid probability for {field}: {value}")]
    InvalidProbability { field: &'static str, value: f64 },
    #[error("invalid bitrate: max {max} below guaranteed {guaranteed}")]
    InvalidBitrate { guaranteed: u64, max: u64 },
    #[error("invalid limit: fixed-capacity admission requires a positive limit")]
    InvalidLimit,
    #[error("invalid readmission: attempts must be positive")]
    InvalidReadmission,
    #[error("invalid activity window for {bearer}: start={start}ms stop={stop}ms")]
    InvalidWindow {
        bearer: BearerId,
        start: u64,
        stop: u64,
    },
    #[error("invalid queue: {0} bytes exceeds the largest supported queue")]
    InvalidQueue(u64),
    #[error("packets of {bearer} ({size} bytes) do not fit its {queue} byte queue")]
    OversizedPacket {
        bearer: BearerId,
        size: u64,
        queue: u64,
    },
    #[error("no terminals configured")]
    NoTerminals,
    #[error("too many bearers on terminal {0}")]
    TooManyBearers(TerminalId),
    #[error("parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("runtime error: {0}")]
    Runtime(#[from] qosim_runtime::Error),
}

/// Identity of a user terminal (its index in the cell).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TerminalId(pub u32);

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ue{}", self.0)
    }
}

/// Identity of a bearer: its terminal and its position within that terminal.
///
/// Identities order by terminal first, which is the deterministic tie-break used
/// everywhere bearers are ranked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BearerId {
    pub terminal: TerminalId,
    pub index: u16,
}

impl BearerId {
    pub const fn new(terminal: u32, index: u16) -> Self {
        Self {
            terminal: TerminalId(terminal),
            index,
        }
    }
}

impl fmt::Display for BearerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.terminal, self.index)
    }
}
