//! Bearers: QoS-tagged traffic flows and their lifecycle.
//!
//! A bearer moves through a strict state machine:
//!
//! ```text
//! Requested -> Admitted -> Active -> Released
//!                 ^          |
//!                 |          v
//!                 +----- Preempted -> Released
//! ```
//!
//! Any other transition is a logic error and panics.

use crate::{
    packet::{Packet, Queue},
    profile::{ApplicationProfile, Generator},
    qos::Requirement,
    BearerId,
};
use qosim_runtime::SimTime;
use serde::Serialize;
use std::fmt;

/// Weight of the newest round in the achieved-rate average.
const RATE_SMOOTHING: f64 = 0.1;

/// Lifecycle state of a bearer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    Requested,
    Admitted,
    Active,
    Preempted,
    Released,
}

impl State {
    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Requested, Admitted)
                | (Admitted, Active)
                | (Active, Preempted)
                | (Active, Released)
                | (Preempted, Admitted)
                | (Preempted, Released)
        )
    }

    /// Whether the bearer currently holds an admission.
    pub fn is_admitted(self) -> bool {
        matches!(self, State::Admitted | State::Active)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Requested => "requested",
            State::Admitted => "admitted",
            State::Active => "active",
            State::Preempted => "preempted",
            State::Released => "released",
        };
        f.write_str(name)
    }
}

/// Per-bearer counters accumulated over the whole run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Totals {
    pub delivered_packets: u64,
    pub delivered_bits: u64,
    pub dropped_packets: u64,
    pub dropped_bits: u64,

    /// Sum of delivery delays in milliseconds.
    pub delay: u64,
}

/// A traffic flow attached to one terminal.
pub struct Bearer {
    id: BearerId,
    profile: ApplicationProfile,
    requirement: Requirement,
    generator: Generator,
    queue: Queue,
    state: State,

    // Set when a release arrives before the first allocation
    closed: bool,

    generating: bool,
    epoch: u32,
    next_sequence: u64,

    admission: Option<u64>,
    since: Option<SimTime>,
    service: u64,

    last_served: Option<(SimTime, u32)>,
    last_grant: u32,
    average_rate: f64,
    readmissions: u32,

    pub totals: Totals,
}

impl Bearer {
    pub fn new(
        id: BearerId,
        profile: ApplicationProfile,
        requirement: Requirement,
        generator: Generator,
        queue_bytes: u64,
    ) -> Self {
        Self {
            id,
            profile,
            requirement,
            generator,
            queue: Queue::new(queue_bytes),
            state: State::Requested,
            closed: false,
            generating: false,
            epoch: 0,
            next_sequence: 0,
            admission: None,
            since: None,
            service: 0,
            last_served: None,
            last_grant: 0,
            average_rate: 0.0,
            readmissions: 0,
            totals: Totals::default(),
        }
    }

    pub fn id(&self) -> BearerId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn profile(&self) -> &ApplicationProfile {
        &self.profile
    }

    pub fn requirement(&self) -> &Requirement {
        &self.requirement
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut Queue {
        &mut self.queue
    }

    /// Move to `next`, returning the previous state.
    ///
    /// # Panics
    ///
    /// Panics if `next` is not reachable from the current state.
    pub fn transition(&mut self, next: State, now: SimTime) -> State {
        let previous = self.state;
        assert!(
            previous.can_transition(next),
            "invalid bearer transition for {}: {} -> {}",
            self.id,
            previous,
            next
        );
        if next == State::Admitted {
            self.since = Some(now);
        } else if previous.is_admitted() && !next.is_admitted() {
            self.settle(now);
        }
        self.state = next;
        previous
    }

    fn settle(&mut self, now: SimTime) {
        if let Some(since) = self.since.take() {
            self.service += now.since(since);
        }
    }

    /// Whether the bearer takes part in scheduling and counts towards load.
    pub fn is_scheduled(&self) -> bool {
        self.state.is_admitted() && !self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Retire an admitted bearer that was never served.
    ///
    /// The bearer keeps its state (there is no edge from Admitted to Released) but stops
    /// counting towards load and receiving resource.
    pub fn close(&mut self, now: SimTime) {
        self.closed = true;
        self.stop_traffic();
        self.settle(now);
    }

    /// Record the sequence number assigned when the bearer was admitted.
    pub fn set_admission(&mut self, sequence: u64) {
        self.admission = Some(sequence);
    }

    /// Order in which the bearer was (last) admitted.
    pub fn admission(&self) -> Option<u64> {
        self.admission
    }

    /// When the current admission began.
    pub fn admitted_at(&self) -> Option<SimTime> {
        self.since
    }

    /// Milliseconds spent admitted up to `end`.
    pub fn service_time(&self, end: SimTime) -> u64 {
        let open = self.since.map_or(0, |since| end.since(since));
        self.service + open
    }

    /// Begin generating traffic, returning the epoch that arrivals must carry.
    pub fn start_traffic(&mut self) -> u32 {
        self.generating = true;
        self.epoch = self.epoch.wrapping_add(1);
        self.epoch
    }

    /// Stop generating traffic; arrivals from earlier epochs become stale.
    pub fn stop_traffic(&mut self) {
        self.generating = false;
        self.epoch = self.epoch.wrapping_add(1);
    }

    /// Whether an arrival stamped with `epoch` is still current.
    pub fn is_generating(&self, epoch: u32) -> bool {
        self.generating && self.epoch == epoch
    }

    /// Draw the next packet, stamped at `now`.
    pub fn next_packet(&mut self, now: SimTime) -> Packet {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let size = self.generator.next_size();
        Packet::new(self.id, sequence, size, now, self.requirement.max_delay)
    }

    /// Draw the gap until the following packet.
    pub fn next_gap(&mut self) -> u64 {
        self.generator.next_gap()
    }

    /// When and at which position in the round the bearer was last granted resource.
    pub fn last_served(&self) -> Option<(SimTime, u32)> {
        self.last_served
    }

    /// Units granted in the most recent round the bearer was served.
    pub fn last_grant(&self) -> u32 {
        self.last_grant
    }

    pub fn served(&mut self, now: SimTime, position: u32, units: u32) {
        self.last_served = Some((now, position));
        self.last_grant = units;
    }

    /// Smoothed achieved rate in bits per second.
    pub fn average_rate(&self) -> f64 {
        self.average_rate
    }

    /// Fold the bits sent in one round of `interval` milliseconds into the average.
    pub fn update_rate(&mut self, bits: u64, interval: u64) {
        let rate = bits as f64 * 1_000.0 / interval.max(1) as f64;
        self.average_rate = (1.0 - RATE_SMOOTHING) * self.average_rate + RATE_SMOOTHING * rate;
    }

    /// Number of readmission attempts since the last preemption.
    pub fn readmissions(&self) -> u32 {
        self.readmissions
    }

    pub fn set_readmissions(&mut self, attempts: u32) {
        self.readmissions = attempts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bearer() -> Bearer {
        let profile = ApplicationProfile::constant(9, 100.0, 10.0);
        let requirement = profile.requirement().unwrap();
        let generator = Generator::new(&profile, 30, 0).unwrap();
        Bearer::new(BearerId::new(0, 0), profile, requirement, generator, 10_000)
    }

    fn at(millis: u64) -> SimTime {
        SimTime::from_millis(millis)
    }

    #[test]
    fn test_lifecycle_edges() {
        use State::*;
        let all = [Requested, Admitted, Active, Preempted, Released];
        let mut edges = Vec::new();
        for from in all {
            for to in all {
                if from.can_transition(to) {
                    edges.push((from, to));
                }
            }
        }
        assert_eq!(
            edges,
            vec![
                (Requested, Admitted),
                (Admitted, Active),
                (Active, Preempted),
                (Active, Released),
                (Preempted, Admitted),
                (Preempted, Released),
            ]
        );
    }

    #[test]
    fn test_service_time() {
        let mut bearer = bearer();
        bearer.transition(State::Admitted, at(100));
        bearer.transition(State::Active, at(101));
        assert_eq!(bearer.service_time(at(150)), 50);

        bearer.transition(State::Preempted, at(200));
        assert_eq!(bearer.service_time(at(1_000)), 100);

        bearer.transition(State::Admitted, at(300));
        bearer.transition(State::Active, at(300));
        bearer.transition(State::Released, at(350));
        assert_eq!(bearer.service_time(at(1_000)), 150);
        assert_eq!(bearer.state(), State::Released);
    }

    #[test]
    #[should_panic(expected = "invalid bearer transition for ue0/0: requested -> active")]
    fn test_skip_admission_panics() {
        let mut bearer = bearer();
        bearer.transition(State::Active, at(0));
    }

    #[test]
    #[should_panic(expected = "invalid bearer transition for ue0/0: admitted -> released")]
    fn test_release_before_service_panics() {
        let mut bearer = bearer();
        bearer.transition(State::Admitted, at(0));
        bearer.transition(State::Released, at(1));
    }

    #[test]
    fn test_close() {
        let mut bearer = bearer();
        bearer.transition(State::Admitted, at(0));
        let epoch = bearer.start_traffic();
        assert!(bearer.is_scheduled());
        assert!(bearer.is_generating(epoch));

        bearer.close(at(40));
        assert!(!bearer.is_scheduled());
        assert!(!bearer.is_generating(epoch));
        assert_eq!(bearer.state(), State::Admitted);
        assert_eq!(bearer.service_time(at(100)), 40);
    }

    #[test]
    fn test_epochs() {
        let mut bearer = bearer();
        let first = bearer.start_traffic();
        bearer.stop_traffic();
        let second = bearer.start_traffic();
        assert!(!bearer.is_generating(first));
        assert!(bearer.is_generating(second));
    }

    #[test]
    fn test_packets() {
        let mut bearer = bearer();
        let first = bearer.next_packet(at(5));
        let second = bearer.next_packet(at(15));
        assert_eq!((first.sequence, second.sequence), (0, 1));
        assert_eq!(first.size, 130);
        assert_eq!(first.deadline, at(305));
        assert_eq!(bearer.next_gap(), 10);
    }

    #[test]
    fn test_rate_smoothing() {
        let mut bearer = bearer();
        bearer.update_rate(1_000, 1);
        assert!((bearer.average_rate() - 100_000.0).abs() < 1e-6);
        bearer.update_rate(0, 1);
        assert!((bearer.average_rate() - 90_000.0).abs() < 1e-6);
    }
}
