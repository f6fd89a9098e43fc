//! A deterministic runtime that dispatches events in `(timestamp, sequence)` order.
//!
//! # Panics
//!
//! If the event order is ever observed to move backwards in time, the runtime will panic.
//!
//! # Example
//!
//! ```rust
//! use qosim_runtime::{deterministic::{Context, Executor}, Clock, Error, Handler, SimTime};
//!
//! struct Echo(Vec<(SimTime, &'static str)>);
//!
//! impl Handler for Echo {
//!     type Event = &'static str;
//!
//!     fn handle(&mut self, context: &mut Context<Self::Event>, event: Self::Event) -> Result<(), Error> {
//!         self.0.push((context.current(), event));
//!         if event == "ping" {
//!             context.schedule_after(10, "pong")?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut executor = Executor::default();
//! executor.context().schedule(SimTime::ZERO, "ping").unwrap();
//! let mut echo = Echo(Vec::new());
//! executor.run(&mut echo, SimTime::from_millis(100)).unwrap();
//! assert_eq!(echo.0.len(), 2);
//! println!("Auditor state: {}", executor.auditor().state());
//! ```

use crate::{hex, Clock, Error, Handler, SimTime, METRICS_PREFIX};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge},
    registry::{Metric, Registry},
};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::{cmp::Ordering, collections::BinaryHeap, fmt::Debug};
use tracing::trace;

#[derive(Debug)]
struct Metrics {
    events_scheduled: Counter,
    events_processed: Counter,
    events_skipped: Counter,
    pending: Gauge,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            events_scheduled: Counter::default(),
            events_processed: Counter::default(),
            events_skipped: Counter::default(),
            pending: Gauge::default(),
        };
        registry.register(
            "events_scheduled",
            "Total number of events scheduled",
            metrics.events_scheduled.clone(),
        );
        registry.register(
            "events_processed",
            "Total number of events dispatched to the handler",
            metrics.events_processed.clone(),
        );
        registry.register(
            "events_skipped",
            "Total number of events whose target was no longer live",
            metrics.events_skipped.clone(),
        );
        registry.register(
            "pending",
            "Number of events waiting in the queue",
            metrics.pending.clone(),
        );
        metrics
    }
}

/// Track the state of the runtime for determinism auditing.
#[derive(Default)]
pub struct Auditor {
    hash: Vec<u8>,
}

impl Auditor {
    fn dispatch(&mut self, time: SimTime, sequence: u64, event: &impl Debug, live: bool) {
        let mut hasher = Sha256::new();
        hasher.update(&self.hash);
        hasher.update(b"dispatch");
        hasher.update(time.as_millis().to_be_bytes());
        hasher.update(sequence.to_be_bytes());
        hasher.update([live as u8]);
        hasher.update(format!("{event:?}").as_bytes());
        self.hash = hasher.finalize().to_vec();
    }

    fn rand(&mut self, method: &str) {
        let mut hasher = Sha256::new();
        hasher.update(&self.hash);
        hasher.update(b"rand");
        hasher.update(method.as_bytes());
        self.hash = hasher.finalize().to_vec();
    }

    /// Generate a representation of the current state of the runtime.
    ///
    /// This can be used to ensure that logic running on top
    /// of the runtime is interacting deterministically.
    pub fn state(&self) -> String {
        hex(&self.hash)
    }
}

/// An event waiting in the queue.
struct Scheduled<E> {
    time: SimTime,
    sequence: u64,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.sequence == other.sequence
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse the ordering for min-heap
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Configuration for the `deterministic` runtime.
#[derive(Clone, Debug)]
pub struct Config {
    /// Seed for the random number generator.
    pub seed: u64,

    /// Maximum number of events that may be dispatched at a single timestamp before the
    /// run is considered stalled (an event rescheduling itself without advancing time).
    pub max_events_per_instant: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            max_events_per_instant: 100_000,
        }
    }
}

/// Environment handed to a [Handler] with every event.
pub struct Context<E> {
    now: SimTime,
    sequence: u64,
    queue: BinaryHeap<Scheduled<E>>,
    rng: StdRng,
    registry: Registry,
    metrics: Metrics,
    auditor: Auditor,
}

impl<E: Debug> Context<E> {
    fn new(seed: u64) -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::init(registry.sub_registry_with_prefix(METRICS_PREFIX));
        Self {
            now: SimTime::ZERO,
            sequence: 0,
            queue: BinaryHeap::new(),
            rng: StdRng::seed_from_u64(seed),
            registry,
            metrics,
            auditor: Auditor::default(),
        }
    }

    /// Insert `event` at virtual time `at`.
    ///
    /// Returns the sequence number assigned to the event or [Error::OutOfOrder] if `at`
    /// is earlier than the current time.
    pub fn schedule(&mut self, at: SimTime, event: E) -> Result<u64, Error> {
        if at < self.now {
            return Err(Error::OutOfOrder {
                now: self.now,
                requested: at,
            });
        }
        let sequence = self.sequence;
        self.sequence = self
            .sequence
            .checked_add(1)
            .expect("event sequence overflow");
        trace!(%at, sequence, ?event, "scheduled");
        self.queue.push(Scheduled {
            time: at,
            sequence,
            event,
        });
        self.metrics.events_scheduled.inc();
        self.metrics.pending.set(self.queue.len() as i64);
        Ok(sequence)
    }

    /// Insert `event` `delay` milliseconds after the current time.
    pub fn schedule_after(&mut self, delay: u64, event: E) -> Result<u64, Error> {
        self.schedule(self.now.after(delay), event)
    }

    /// Number of events waiting to be dispatched.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn next_time(&self) -> Option<SimTime> {
        self.queue.peek().map(|scheduled| scheduled.time)
    }

    fn pop(&mut self) -> Option<Scheduled<E>> {
        let scheduled = self.queue.pop()?;
        self.metrics.pending.set(self.queue.len() as i64);
        Some(scheduled)
    }
}

impl<E> Clock for Context<E> {
    fn current(&self) -> SimTime {
        self.now
    }
}

impl<E> crate::Metrics for Context<E> {
    fn register<N: Into<String>, H: Into<String>>(&mut self, name: N, help: H, metric: impl Metric) {
        let name = name.into();
        assert!(
            !name.starts_with(METRICS_PREFIX),
            "using runtime label is not allowed"
        );
        self.registry.register(name, help, metric);
    }

    fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry).expect("encoding failed");
        buffer
    }
}

impl<E> RngCore for Context<E> {
    fn next_u32(&mut self) -> u32 {
        self.auditor.rand("next_u32");
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.auditor.rand("next_u64");
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.auditor.rand("fill_bytes");
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.auditor.rand("try_fill_bytes");
        self.rng.try_fill_bytes(dest)
    }
}

/// Deterministic runtime that dispatches events in `(timestamp, sequence)` order.
pub struct Executor<E> {
    context: Context<E>,
    cap: u64,
    instant: SimTime,
    dispatched: u64,
}

impl<E: Debug> Executor<E> {
    /// Initialize a new `deterministic` runtime with the given configuration.
    pub fn init(cfg: Config) -> Self {
        // Ensure config is valid
        if cfg.max_events_per_instant == 0 {
            panic!("max events per instant must be non-zero");
        }

        Self {
            context: Context::new(cfg.seed),
            cap: cfg.max_events_per_instant,
            instant: SimTime::ZERO,
            dispatched: 0,
        }
    }

    /// Initialize a new `deterministic` runtime with the default configuration
    /// and the provided seed.
    pub fn seeded(seed: u64) -> Self {
        let cfg = Config {
            seed,
            ..Config::default()
        };
        Self::init(cfg)
    }

    /// Initialize a new `deterministic` runtime with the default configuration.
    // We'd love to implement the trait but we can't because of the generic event type.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::init(Config::default())
    }

    /// Access the context (to seed initial events or register metrics before a run).
    pub fn context(&mut self) -> &mut Context<E> {
        &mut self.context
    }

    /// Access the determinism auditor.
    pub fn auditor(&self) -> &Auditor {
        &self.context.auditor
    }

    /// Dispatch events to `handler` until the queue is empty or the next event is later
    /// than `until`.
    ///
    /// Returns the virtual time at which the run stopped. Events later than `until` stay
    /// queued and a later call to `run` picks them up.
    pub fn run<H: Handler<Event = E>>(
        &mut self,
        handler: &mut H,
        until: SimTime,
    ) -> Result<SimTime, Error> {
        while let Some(next) = self.context.next_time() {
            if next > until {
                break;
            }
            let Some(Scheduled {
                time,
                sequence,
                event,
            }) = self.context.pop()
            else {
                break;
            };
            assert!(
                time >= self.context.now,
                "time moved backwards: {} -> {}",
                self.context.now,
                time
            );

            // Guard against events that reschedule themselves without advancing time
            if time == self.instant {
                self.dispatched += 1;
                if self.dispatched > self.cap {
                    return Err(Error::Stalled {
                        time,
                        cap: self.cap,
                    });
                }
            } else {
                self.instant = time;
                self.dispatched = 1;
            }
            self.context.now = time;

            // Skip events whose target has gone away
            let live = handler.is_live(&event);
            self.context.auditor.dispatch(time, sequence, &event, live);
            if !live {
                trace!(%time, sequence, ?event, "skipped");
                self.context.metrics.events_skipped.inc();
                continue;
            }
            trace!(%time, sequence, ?event, "dispatching");
            handler.handle(&mut self.context, event)?;
            self.context.metrics.events_processed.inc();
        }

        // Settle the clock at the end of the requested window
        if until != SimTime::MAX && self.context.now < until {
            self.context.now = until;
        }
        Ok(self.context.now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Metrics as _;
    use qosim_macros::test_traced;
    use rand::Rng;
    use test_case::test_case;

    /// Records every dispatch and optionally fans out follow-up events.
    #[derive(Default)]
    struct Recorder {
        seen: Vec<(SimTime, u32)>,
        dead: Vec<u32>,
        jitter: bool,
    }

    impl Handler for Recorder {
        type Event = u32;

        fn is_live(&self, event: &u32) -> bool {
            !self.dead.contains(event)
        }

        fn handle(&mut self, context: &mut Context<u32>, event: u32) -> Result<(), Error> {
            self.seen.push((context.current(), event));
            if self.jitter && event < 20 {
                let delay = context.gen_range(0..5);
                context.schedule_after(delay, event + 1)?;
            }
            Ok(())
        }
    }

    fn run_with_seed(seed: u64) -> (String, Vec<(SimTime, u32)>) {
        let mut executor = Executor::seeded(seed);
        executor.context().schedule(SimTime::ZERO, 0).unwrap();
        let mut recorder = Recorder {
            jitter: true,
            ..Default::default()
        };
        executor.run(&mut recorder, SimTime::MAX).unwrap();
        (executor.auditor().state(), recorder.seen)
    }

    #[test]
    fn test_same_seed_same_order() {
        // Generate initial outputs
        let mut outputs = Vec::new();
        for seed in 0..100 {
            outputs.push(run_with_seed(seed));
        }

        // Ensure they match
        for seed in 0..100 {
            assert_eq!(run_with_seed(seed), outputs[seed as usize]);
        }
    }

    #[test_traced("TRACE")]
    fn test_different_seeds_different_order() {
        let output1 = run_with_seed(12345);
        let output2 = run_with_seed(54321);
        assert_ne!(output1, output2);
    }

    #[test]
    fn test_scheduled_min_heap() {
        // Populate heap
        let mut heap = BinaryHeap::new();
        for (time, sequence) in [(10, 0), (5, 1), (15, 2), (5, 3)] {
            heap.push(Scheduled {
                time: SimTime::from_millis(time),
                sequence,
                event: (),
            });
        }

        // Verify (time, sequence) order
        let mut sorted = Vec::new();
        while let Some(scheduled) = heap.pop() {
            sorted.push((scheduled.time.as_millis(), scheduled.sequence));
        }
        assert_eq!(sorted, vec![(5, 1), (5, 3), (10, 0), (15, 2)]);
    }

    #[test_traced]
    fn test_ties_break_by_insertion() {
        let mut executor = Executor::default();
        let context = executor.context();
        context.schedule(SimTime::from_millis(3), 1).unwrap();
        context.schedule(SimTime::from_millis(1), 2).unwrap();
        context.schedule(SimTime::from_millis(3), 3).unwrap();
        context.schedule(SimTime::from_millis(1), 4).unwrap();

        let mut recorder = Recorder::default();
        executor.run(&mut recorder, SimTime::MAX).unwrap();
        let events: Vec<u32> = recorder.seen.iter().map(|(_, event)| *event).collect();
        assert_eq!(events, vec![2, 4, 1, 3]);
    }

    #[test_traced]
    fn test_run_stops_at_horizon() {
        let mut executor = Executor::default();
        let context = executor.context();
        context.schedule(SimTime::from_millis(5), 1).unwrap();
        context.schedule(SimTime::from_millis(10), 2).unwrap();
        context.schedule(SimTime::from_millis(11), 3).unwrap();

        let mut recorder = Recorder::default();
        let stopped = executor.run(&mut recorder, SimTime::from_millis(10)).unwrap();
        assert_eq!(stopped, SimTime::from_millis(10));
        assert_eq!(recorder.seen.len(), 2);
        assert_eq!(executor.context().pending(), 1);

        // Resume the same run
        executor.run(&mut recorder, SimTime::MAX).unwrap();
        assert_eq!(recorder.seen.last(), Some(&(SimTime::from_millis(11), 3)));
    }

    #[test_traced]
    fn test_out_of_order_rejected() {
        let mut executor: Executor<u32> = Executor::default();
        executor.context().schedule(SimTime::from_millis(5), 1).unwrap();
        let mut recorder = Recorder::default();
        executor.run(&mut recorder, SimTime::from_millis(20)).unwrap();

        let result = executor.context().schedule(SimTime::from_millis(19), 2);
        assert_eq!(
            result,
            Err(Error::OutOfOrder {
                now: SimTime::from_millis(20),
                requested: SimTime::from_millis(19),
            })
        );
    }

    #[test_case(1; "single event")]
    #[test_case(50; "fifty events")]
    #[test_case(10_000; "ten thousand events")]
    fn test_stall_detected(cap: u64) {
        struct Spinner;

        impl Handler for Spinner {
            type Event = ();

            fn handle(&mut self, context: &mut Context<()>, _: ()) -> Result<(), Error> {
                context.schedule_after(0, ())?;
                Ok(())
            }
        }

        let mut executor = Executor::init(Config {
            seed: 0,
            max_events_per_instant: cap,
        });
        executor.context().schedule(SimTime::from_millis(7), ()).unwrap();
        let result = executor.run(&mut Spinner, SimTime::MAX);
        assert_eq!(
            result,
            Err(Error::Stalled {
                time: SimTime::from_millis(7),
                cap,
            })
        );
    }

    #[test_traced]
    fn test_dead_targets_skipped() {
        let mut executor = Executor::default();
        for event in 0..4 {
            executor
                .context()
                .schedule(SimTime::from_millis(event as u64), event)
                .unwrap();
        }
        let mut recorder = Recorder {
            dead: vec![1, 3],
            ..Default::default()
        };
        executor.run(&mut recorder, SimTime::MAX).unwrap();
        let events: Vec<u32> = recorder.seen.iter().map(|(_, event)| *event).collect();
        assert_eq!(events, vec![0, 2]);

        let encoded = executor.context().encode();
        assert!(encoded.contains("runtime_events_processed_total 2"));
        assert!(encoded.contains("runtime_events_skipped_total 2"));
        assert!(encoded.contains("runtime_events_scheduled_total 4"));
    }

    #[test]
    #[should_panic(expected = "max events per instant must be non-zero")]
    fn test_bad_cap() {
        let cfg = Config {
            max_events_per_instant: 0,
            ..Config::default()
        };
        Executor::<()>::init(cfg);
    }

    #[test]
    #[should_panic(expected = "using runtime label is not allowed")]
    fn test_reserved_metric_name() {
        let mut executor: Executor<()> = Executor::default();
        executor
            .context()
            .register("runtime_custom", "clashes", Counter::<u64>::default());
    }
}
