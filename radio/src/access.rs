//! Admission control for new (and returning) bearers.
//!
//! An [AccessControl] policy only decides. It never changes bearer state; the caller
//! applies the transition that matches the returned [Decision].

use crate::{qos::Feedback, BearerId};
use serde::{Deserialize, Serialize};

/// A bearer asking to enter (or re-enter) the cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    pub bearer: BearerId,

    /// QoS priority level (1 is the most important).
    pub priority: u8,

    /// Units per round the bearer would reserve (zero for best effort).
    pub reservation: u32,
}

/// Aggregate load of the cell when the request is evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Load {
    /// Bearers currently admitted or active.
    pub bearers: usize,

    /// Units per round already reserved.
    pub reserved: u32,

    /// Units per round on the grid.
    pub capacity: u32,
}

/// Why a request was turned away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Reason {
    /// The cell already carries its maximum number of bearers.
    BearerLimit { limit: usize },

    /// The reservation does not fit; `deficit` units would have to be freed.
    Capacity { deficit: u32 },
}

/// Outcome of an admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Reject(Reason),

    /// Defer and ask again later.
    Queue,
}

/// Decides whether a bearer may enter.
pub trait AccessControl {
    fn admit(&self, request: &Request, load: &Load, feedback: &Feedback) -> Decision;
}

/// Admits everything.
pub struct AdmitAll;

impl AccessControl for AdmitAll {
    fn admit(&self, _: &Request, _: &Load, _: &Feedback) -> Decision {
        Decision::Admit
    }
}

/// Rejects once the number of admitted bearers reaches `limit`.
pub struct FixedCapacity {
    pub limit: usize,
}

impl AccessControl for FixedCapacity {
    fn admit(&self, _: &Request, load: &Load, _: &Feedback) -> Decision {
        if load.bearers >= self.limit {
            return Decision::Reject(Reason::BearerLimit { limit: self.limit });
        }
        Decision::Admit
    }
}

/// Defers while equally or more important bearers are in violation, and rejects
/// guaranteed-rate requests whose reservation would overbook the grid.
pub struct QosAware;

impl AccessControl for QosAware {
    fn admit(&self, request: &Request, load: &Load, feedback: &Feedback) -> Decision {
        let stressed = feedback
            .violated()
            .any(|(bearer, report)| *bearer != request.bearer && report.priority <= request.priority);
        if stressed {
            return Decision::Queue;
        }
        let needed = load.reserved as u64 + request.reservation as u64;
        if needed > load.capacity as u64 {
            return Decision::Reject(Reason::Capacity {
                deficit: (needed - load.capacity as u64) as u32,
            });
        }
        Decision::Admit
    }
}

/// Selector for an [AccessControl] policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    #[default]
    AdmitAll,
    FixedCapacity,
    QosAware,
}

impl Kind {
    /// Instantiate the policy (`limit` is only used by [Kind::FixedCapacity]).
    pub fn build(self, limit: usize) -> Box<dyn AccessControl> {
        match self {
            Kind::AdmitAll => Box::new(AdmitAll),
            Kind::FixedCapacity => Box::new(FixedCapacity { limit }),
            Kind::QosAware => Box::new(QosAware),
        }
    }
}
