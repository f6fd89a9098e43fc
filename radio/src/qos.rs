//! QoS classes, requirements, and the windowed monitor that checks bearers against them.
//!
//! The [Monitor] keeps a sliding time window of deliveries and drops per bearer. Packet
//! events update the window as they happen; each monitoring tick condenses it into a fresh
//! [Sample] (replacing the previous one) and compares the sample with the bearer's
//! [Requirement]. The resulting [Report]s are published as [Feedback], which admission
//! and preemption read on later events.

use crate::BearerId;
use qosim_runtime::SimTime;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Standardized characteristics of a QoS class identifier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QosClass {
    pub qci: u8,

    /// Priority level (1 is the most important).
    pub priority: u8,

    /// Packet delay budget in milliseconds.
    pub delay_budget: u64,

    /// Packet loss rate target.
    pub loss_rate: f64,
}

const CLASSES: [QosClass; 9] = [
    QosClass::new(1, 2, 100, 1e-2),
    QosClass::new(2, 4, 150, 1e-3),
    QosClass::new(3, 3, 50, 1e-3),
    QosClass::new(4, 5, 300, 1e-6),
    QosClass::new(5, 1, 100, 1e-6),
    QosClass::new(6, 6, 300, 1e-6),
    QosClass::new(7, 7, 100, 1e-3),
    QosClass::new(8, 8, 300, 1e-6),
    QosClass::new(9, 9, 300, 1e-6),
];

impl QosClass {
    const fn new(qci: u8, priority: u8, delay_budget: u64, loss_rate: f64) -> Self {
        Self {
            qci,
            priority,
            delay_budget,
            loss_rate,
        }
    }

    /// Look up a class by identifier.
    pub fn lookup(qci: u8) -> Option<Self> {
        CLASSES.iter().find(|class| class.qci == qci).copied()
    }
}

/// What a bearer is owed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Requirement {
    pub class: QosClass,
    pub guaranteed_bitrate: u64,
    pub max_bitrate: Option<u64>,

    /// Milliseconds.
    pub max_delay: u64,
    pub max_loss: f64,
}

impl Requirement {
    /// Whether the bearer holds a guaranteed-rate reservation.
    pub fn is_guaranteed(&self) -> bool {
        self.guaranteed_bitrate > 0
    }

    pub fn priority(&self) -> u8 {
        self.class.priority
    }
}

/// Windowed measurements of one bearer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Sample {
    /// Delivered bits per second.
    pub throughput: f64,

    /// Mean delay of delivered packets in milliseconds (zero when nothing was delivered).
    pub delay: f64,

    /// Largest delay of a delivered packet in milliseconds.
    pub max_delay: u64,

    /// Dropped bits over offered bits (zero when nothing was offered).
    pub loss: f64,
}

/// A breach of a [Requirement].
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Violation {
    Loss { observed: f64, limit: f64 },
    Delay { observed: f64, limit: u64 },
    Throughput { observed: f64, guaranteed: u64 },
}

/// The outcome of one monitoring tick for one bearer.
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    pub sample: Sample,
    pub violations: Vec<Violation>,

    /// Priority level of the bearer when the report was produced.
    pub priority: u8,
}

impl Report {
    pub fn is_violated(&self) -> bool {
        !self.violations.is_empty()
    }
}

/// The latest published report of every monitored bearer.
#[derive(Clone, Debug, Default)]
pub struct Feedback {
    reports: BTreeMap<BearerId, Report>,
}

impl Feedback {
    pub fn get(&self, bearer: &BearerId) -> Option<&Report> {
        self.reports.get(bearer)
    }

    pub fn sample(&self, bearer: &BearerId) -> Option<&Sample> {
        self.reports.get(bearer).map(|report| &report.sample)
    }

    pub fn is_violated(&self, bearer: &BearerId) -> bool {
        self.reports
            .get(bearer)
            .is_some_and(|report| report.is_violated())
    }

    /// Bearers whose latest report breached their requirement, in identity order.
    pub fn violated(&self) -> impl Iterator<Item = (&BearerId, &Report)> {
        self.reports
            .iter()
            .filter(|(_, report)| report.is_violated())
    }

    /// Insert a report directly (used when scenarios are assembled by hand).
    pub fn insert(&mut self, bearer: BearerId, report: Report) {
        self.reports.insert(bearer, report);
    }
}

/// What the monitor needs to know about a bearer at tick time.
pub struct Subject<'a> {
    pub bearer: BearerId,
    pub requirement: &'a Requirement,

    /// When the bearer was (last) admitted.
    pub admitted: SimTime,

    /// Whether the bearer still has traffic waiting.
    pub backlogged: bool,
}

enum Outcome {
    Delivered { bits: u64, delay: u64 },
    Dropped { bits: u64 },
}

#[derive(Default)]
struct Window {
    entries: VecDeque<(SimTime, Outcome)>,
}

impl Window {
    fn evict(&mut self, now: SimTime, length: u64) {
        while let Some((time, _)) = self.entries.front() {
            if now.since(*time) < length {
                break;
            }
            self.entries.pop_front();
        }
    }

    /// Aggregate the entries recorded at or after `since`.
    fn sample(&self, since: SimTime, span: u64) -> Sample {
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        let mut packets = 0u64;
        let mut total_delay = 0u64;
        let mut max_delay = 0u64;
        for (_, outcome) in self.entries.iter().filter(|(time, _)| *time >= since) {
            match *outcome {
                Outcome::Delivered { bits, delay } => {
                    delivered += bits;
                    packets += 1;
                    total_delay += delay;
                    max_delay = max_delay.max(delay);
                }
                Outcome::Dropped { bits } => dropped += bits,
            }
        }
        let offered = delivered + dropped;
        Sample {
            throughput: delivered as f64 * 1_000.0 / span.max(1) as f64,
            delay: if packets == 0 {
                0.0
            } else {
                total_delay as f64 / packets as f64
            },
            max_delay,
            loss: if offered == 0 {
                0.0
            } else {
                dropped as f64 / offered as f64
            },
        }
    }
}

/// Sliding-window QoS monitor.
pub struct Monitor {
    length: u64,
    windows: BTreeMap<BearerId, Window>,
    feedback: Feedback,
}

impl Monitor {
    /// Create a monitor whose windows span `length` milliseconds.
    pub fn new(length: u64) -> Self {
        Self {
            length,
            windows: BTreeMap::new(),
            feedback: Feedback::default(),
        }
    }

    /// Record a delivered packet.
    pub fn delivered(&mut self, bearer: BearerId, now: SimTime, bits: u64, delay: u64) {
        let window = self.windows.entry(bearer).or_default();
        window.evict(now, self.length);
        window
            .entries
            .push_back((now, Outcome::Delivered { bits, delay }));
    }

    /// Record a dropped packet.
    pub fn dropped(&mut self, bearer: BearerId, now: SimTime, bits: u64) {
        let window = self.windows.entry(bearer).or_default();
        window.evict(now, self.length);
        window.entries.push_back((now, Outcome::Dropped { bits }));
    }

    /// Stop tracking a bearer (its window and published report are discarded).
    pub fn forget(&mut self, bearer: &BearerId) {
        self.windows.remove(bearer);
        self.feedback.reports.remove(bearer);
    }

    /// Published feedback from the latest tick.
    pub fn feedback(&self) -> &Feedback {
        &self.feedback
    }

    /// Sample every subject, check it against its requirement, and publish the result.
    ///
    /// Returns the new reports in subject order. Reports of bearers that are not
    /// subjects of this tick are withdrawn.
    pub fn tick(&mut self, now: SimTime, subjects: &[Subject<'_>]) -> Vec<(BearerId, Report)> {
        let mut reports = Vec::with_capacity(subjects.len());
        for subject in subjects {
            let window = self.windows.entry(subject.bearer).or_default();
            window.evict(now, self.length);
            let active = now.since(subject.admitted);
            let sample = window.sample(subject.admitted, active.min(self.length));
            let violations = check(&sample, subject, active >= self.length);
            reports.push((
                subject.bearer,
                Report {
                    sample,
                    violations,
                    priority: subject.requirement.priority(),
                },
            ));
        }

        // Replace (never merge) the previous feedback
        self.feedback.reports = reports.iter().cloned().collect();
        reports
    }
}

fn check(sample: &Sample, subject: &Subject<'_>, settled: bool) -> Vec<Violation> {
    let requirement = subject.requirement;
    let mut violations = Vec::new();
    if sample.loss > requirement.max_loss {
        violations.push(Violation::Loss {
            observed: sample.loss,
            limit: requirement.max_loss,
        });
    }
    if sample.delay > requirement.max_delay as f64 {
        violations.push(Violation::Delay {
            observed: sample.delay,
            limit: requirement.max_delay,
        });
    }
    if requirement.is_guaranteed()
        && settled
        && subject.backlogged
        && sample.throughput < requirement.guaranteed_bitrate as f64
    {
        violations.push(Violation::Throughput {
            observed: sample.throughput,
            guaranteed: requirement.guaranteed_bitrate,
        });
    }
    violations
}
