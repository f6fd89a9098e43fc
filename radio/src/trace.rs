//! Observation records emitted while a simulation runs.
//!
//! Every significant event produces one [Record], tagged with the virtual time and the
//! bearer (or round) it concerns. Records are handed to a [Sink] in the order they
//! occur, so two runs of the same scenario and seed produce identical streams.

use crate::{
    access::Reason,
    bearer::State,
    priority::Score,
    qos::{Sample, Violation},
    scheduler::Grant,
    BearerId,
};
use qosim_runtime::SimTime;
use serde::Serialize;

/// What led to a preemption (or a failed attempt at one).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cause {
    /// A request was rejected for lack of reservable capacity.
    Admission,

    /// Reservations starved the top-ranked bearer of a round.
    Exhaustion,

    /// The monitor reported a QoS violation.
    Qos,
}

/// Why packets were lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Loss {
    /// The bearer's queue was full.
    Overflow,

    /// The delay budget elapsed before transmission.
    Expired,

    /// The bearer was preempted with traffic still queued.
    Preempted,
}

/// One observation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "record")]
pub enum Record {
    Requested {
        time: SimTime,
        bearer: BearerId,
        qci: u8,
    },
    Admitted {
        time: SimTime,
        bearer: BearerId,
        reservation: u32,
    },
    Rejected {
        time: SimTime,
        bearer: BearerId,
        reason: Reason,
    },
    Queued {
        time: SimTime,
        bearer: BearerId,
    },
    Transition {
        time: SimTime,
        bearer: BearerId,
        from: State,
        to: State,
    },
    Preempted {
        time: SimTime,
        bearer: BearerId,
        by: BearerId,
        cause: Cause,
        score: Score,
        requester: Score,
    },
    Released {
        time: SimTime,
        bearer: BearerId,
    },
    Allocation {
        time: SimTime,
        round: u64,
        capacity: u32,
        used: u32,
        grants: Vec<Grant>,
    },
    Exhausted {
        time: SimTime,
        round: u64,
        bearer: BearerId,
        deficit: u32,
    },
    Deficit {
        time: SimTime,
        bearer: BearerId,
        cause: Cause,
        missing: u32,
    },
    Dropped {
        time: SimTime,
        bearer: BearerId,
        reason: Loss,
        packets: u64,
        bits: u64,
    },
    Sample {
        time: SimTime,
        bearer: BearerId,
        sample: Sample,
    },
    Violation {
        time: SimTime,
        bearer: BearerId,
        violations: Vec<Violation>,
    },
}

impl Record {
    pub fn time(&self) -> SimTime {
        match self {
            Record::Requested { time, .. }
            | Record::Admitted { time, .. }
            | Record::Rejected { time, .. }
            | Record::Queued { time, .. }
            | Record::Transition { time, .. }
            | Record::Preempted { time, .. }
            | Record::Released { time, .. }
            | Record::Allocation { time, .. }
            | Record::Exhausted { time, .. }
            | Record::Deficit { time, .. }
            | Record::Dropped { time, .. }
            | Record::Sample { time, .. }
            | Record::Violation { time, .. } => *time,
        }
    }

    /// The bearer the record concerns (none for a round's allocation).
    pub fn bearer(&self) -> Option<BearerId> {
        match self {
            Record::Allocation { .. } => None,
            Record::Requested { bearer, .. }
            | Record::Admitted { bearer, .. }
            | Record::Rejected { bearer, .. }
            | Record::Queued { bearer, .. }
            | Record::Transition { bearer, .. }
            | Record::Preempted { bearer, .. }
            | Record::Released { bearer, .. }
            | Record::Exhausted { bearer, .. }
            | Record::Deficit { bearer, .. }
            | Record::Dropped { bearer, .. }
            | Record::Sample { bearer, .. }
            | Record::Violation { bearer, .. } => Some(*bearer),
        }
    }
}

/// Consumer of observation records.
pub trait Sink {
    fn record(&mut self, record: Record);
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn record(&mut self, record: Record) {
        (**self).record(record)
    }
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct Memory {
    records: Vec<Record>,
}

impl Memory {
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

impl Sink for Memory {
    fn record(&mut self, record: Record) {
        self.records.push(record);
    }
}

/// Drops every record.
pub struct Discard;

impl Sink for Discard {
    fn record(&mut self, _: Record) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let record = Record::Rejected {
            time: SimTime::from_millis(12),
            bearer: BearerId::new(1, 0),
            reason: Reason::BearerLimit { limit: 2 },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "record": "rejected",
                "time": 12,
                "bearer": { "terminal": 1, "index": 0 },
                "reason": { "kind": "bearer-limit", "limit": 2 },
            })
        );
    }

    #[test]
    fn test_allocation_json() {
        let record = Record::Allocation {
            time: SimTime::from_millis(3),
            round: 4,
            capacity: 10,
            used: 6,
            grants: vec![Grant {
                bearer: BearerId::new(0, 1),
                units: 6,
                guaranteed: 2,
            }],
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"record":"allocation","time":3,"round":4,"capacity":10,"used":6,"grants":[{"bearer":{"terminal":0,"index":1},"units":6,"guaranteed":2}]}"#
        );
        assert_eq!(record.bearer(), None);
        assert_eq!(record.time(), SimTime::from_millis(3));
    }

    #[test]
    fn test_memory_sink() {
        let mut sink: Box<dyn Sink> = Box::new(Memory::default());
        sink.record(Record::Queued {
            time: SimTime::ZERO,
            bearer: BearerId::new(0, 0),
        });
        let mut memory = Memory::default();
        memory.record(Record::Released {
            time: SimTime::from_millis(9),
            bearer: BearerId::new(2, 0),
        });
        assert_eq!(memory.records().len(), 1);
        assert_eq!(memory.records()[0].bearer(), Some(BearerId::new(2, 0)));

        let mut discard = Discard;
        discard.record(memory.into_records().remove(0));
    }
}
