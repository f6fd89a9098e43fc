use super::{metrics::Metrics, Event};
use crate::{
    access::{AccessControl, Decision, Load, Reason, Request},
    amc::{round_bits, units},
    bearer::{Bearer, State},
    config::Config,
    packet::Packet,
    preemption::{Preemption, Readmission, Selection},
    priority::{Policy, Score},
    profile::Generator,
    qos::{Monitor, Subject, Violation},
    scheduler::{self, Overflow, Scheduler},
    stats::Summary,
    terminal::{Cell, Terminal},
    trace::{Cause, Loss, Record, Sink},
    BearerId, Error, TerminalId,
};
use qosim_runtime::{deterministic::Context, Clock, Error as RuntimeError, Handler, SimTime};
use rand::{Rng, RngCore};
use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};

fn lookup(cell: &Cell, id: BearerId) -> &Bearer {
    cell.bearer(id)
        .unwrap_or_else(|| panic!("unknown bearer {id}"))
}

fn lookup_mut(cell: &mut Cell, id: BearerId) -> &mut Bearer {
    cell.bearer_mut(id)
        .unwrap_or_else(|| panic!("unknown bearer {id}"))
}

/// Drives one cell through a scenario: admission, scheduling rounds, preemption, and
/// QoS monitoring, all as reactions to events dispatched by the runtime.
pub struct Simulation<S: Sink> {
    cell: Cell,
    policy: Policy,
    scheduler: Scheduler,
    access: Box<dyn AccessControl>,
    preemption: Option<Preemption>,
    qos_triggered: bool,
    readmission: Option<Readmission>,
    monitor: Monitor,

    duration: SimTime,
    retry_interval: u64,
    monitor_interval: u64,
    tx_delay: u64,
    error_rate: f64,
    variation: f64,
    update_interval: u64,

    round: u64,
    admissions: u64,
    metrics: Metrics,
    sink: S,
}

impl<S: Sink> Simulation<S> {
    /// Build the cell described by `config` and seed the initial events into `context`.
    ///
    /// Every bearer's traffic generator is seeded from the context's random source, in
    /// bearer identity order.
    pub fn init(context: &mut Context<Event>, config: &Config, sink: S) -> Result<Self, Error> {
        config.validate()?;
        let interval = config.grid.round_interval_ms;
        let transmission = &config.transmission;

        // Build terminals and bearers
        let mut cell = Cell::new(config.channel_model()?);
        for (terminal, settings) in config.terminals.iter().enumerate() {
            let id = TerminalId(terminal as u32);
            let mut terminal = Terminal::new(id, cell.channel().clamp(settings.cqi as i32));
            for (index, profile) in settings.bearers.iter().enumerate() {
                let requirement = profile.requirement()?;
                let generator =
                    Generator::new(profile, transmission.overhead_bytes, context.next_u64())?;
                terminal.attach(Bearer::new(
                    BearerId {
                        terminal: id,
                        index: index as u16,
                    },
                    profile.clone(),
                    requirement,
                    generator,
                    transmission.queue_bytes,
                ));
            }
            cell.add(terminal);
        }

        // Seed lifecycle events
        for bearer in cell.bearers() {
            let profile = bearer.profile();
            context.schedule(
                SimTime::from_millis(profile.start_ms),
                Event::Setup { bearer: bearer.id() },
            )?;
            if let Some(stop) = profile.stop_ms {
                context.schedule(
                    SimTime::from_millis(stop),
                    Event::Release { bearer: bearer.id() },
                )?;
            }
        }
        context.schedule(SimTime::ZERO, Event::Round)?;
        context.schedule_after(config.qos_monitor.interval_ms, Event::Monitor)?;
        if config.channel.variation > 0.0 {
            context.schedule_after(config.channel.update_interval_ms, Event::Channel)?;
        }

        let policy = config.priority_policy;
        let preemption = config
            .preemption
            .enabled
            .then(|| Preemption::new(config.preemption.ranking.build(interval)));
        info!(
            terminals = cell.terminals().len(),
            bearers = cell.bearers().count(),
            %policy,
            capacity = config.grid.capacity,
            "initialized simulation"
        );
        Ok(Self {
            cell,
            policy,
            scheduler: Scheduler::new(
                config.grid.capacity,
                interval,
                policy.build(interval),
                transmission.overflow,
            ),
            access: config
                .access_control
                .policy
                .build(config.access_control.limit.unwrap_or(0)),
            preemption,
            qos_triggered: config.preemption.qos_triggered,
            readmission: config.preemption.readmission,
            monitor: Monitor::new(config.qos_monitor.window_ms),
            duration: SimTime::from_millis(config.duration_ms),
            retry_interval: config.access_control.retry_interval_ms,
            monitor_interval: config.qos_monitor.interval_ms,
            tx_delay: transmission.tx_delay_ms,
            error_rate: transmission.error_rate,
            variation: config.channel.variation,
            update_interval: config.channel.update_interval_ms,
            round: 0,
            admissions: 0,
            metrics: Metrics::init(context),
            sink,
        })
    }

    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Totals of the run so far, as of `end`.
    pub fn summary(&self, end: SimTime, digest: String) -> Summary {
        Summary::compute(
            self.policy,
            self.metrics.counts(),
            self.cell.bearers(),
            end,
            digest,
        )
    }

    /// When `bearer` stops generating traffic.
    fn stop(&self, bearer: BearerId) -> SimTime {
        lookup(&self.cell, bearer)
            .profile()
            .stop_ms
            .map_or(self.duration, SimTime::from_millis)
    }

    fn reservation(&self, bearer: &Bearer) -> u32 {
        scheduler::reservation(
            bearer.requirement(),
            self.cell.channel(),
            self.scheduler.interval(),
        )
    }

    fn load(&self) -> Load {
        let mut load = Load {
            bearers: 0,
            reserved: 0,
            capacity: self.scheduler.capacity(),
        };
        for bearer in self.cell.bearers().filter(|bearer| bearer.is_scheduled()) {
            load.bearers += 1;
            load.reserved = load.reserved.saturating_add(self.reservation(bearer));
        }
        load
    }

    fn setup(&mut self, context: &mut Context<Event>, id: BearerId) -> Result<(), RuntimeError> {
        let now = context.current();
        let bearer = lookup(&self.cell, id);
        let request = Request {
            bearer: id,
            priority: bearer.requirement().priority(),
            reservation: self.reservation(bearer),
        };
        let qci = bearer.profile().qci;
        let can_preempt = bearer.profile().can_preempt;
        self.sink.record(Record::Requested {
            time: now,
            bearer: id,
            qci,
        });
        let mut decision = self
            .access
            .admit(&request, &self.load(), self.monitor.feedback());

        // Try to free reserved capacity held by lower-ranked bearers
        if let Decision::Reject(Reason::Capacity { deficit }) = decision {
            if can_preempt && self.preemption.is_some() {
                let pool: Vec<(BearerId, u32)> = self
                    .cell
                    .bearers()
                    .filter(|bearer| bearer.requirement().is_guaranteed())
                    .map(|bearer| (bearer.id(), self.reservation(bearer)))
                    .collect();
                if self.preempt_for(context, id, pool, deficit, Cause::Admission)? {
                    decision = Decision::Admit;
                }
            }
        }

        match decision {
            Decision::Admit => self.admit(context, id, request.reservation),
            Decision::Reject(reason) => {
                self.metrics.rejected.inc();
                debug!(bearer = %id, ?reason, "rejected");
                self.sink.record(Record::Rejected {
                    time: now,
                    bearer: id,
                    reason,
                });
                self.retry(context, id, None)
            }
            Decision::Queue => {
                self.metrics.queued.inc();
                debug!(bearer = %id, "queued");
                self.sink.record(Record::Queued {
                    time: now,
                    bearer: id,
                });
                self.retry(context, id, Some(self.retry_interval))
            }
        }
    }

    /// Decide what follows a request that was not admitted.
    fn retry(
        &mut self,
        context: &mut Context<Event>,
        id: BearerId,
        queued: Option<u64>,
    ) -> Result<(), RuntimeError> {
        let now = context.current();
        let stop = self.stop(id);
        let bearer = lookup_mut(&mut self.cell, id);
        match bearer.state() {
            State::Preempted => {
                let attempts = bearer.readmissions() + 1;
                bearer.set_readmissions(attempts);
                match self.readmission {
                    Some(readmission)
                        if attempts < readmission.attempts
                            && now.after(readmission.interval_ms) < stop =>
                    {
                        context.schedule_after(readmission.interval_ms, Event::Setup { bearer: id })?;
                    }
                    _ => {
                        debug!(bearer = %id, attempts, "readmission abandoned");
                        self.finish(now, id);
                    }
                }
            }
            State::Requested => {
                if let Some(interval) = queued {
                    if now.after(interval) < stop {
                        context.schedule_after(interval, Event::Setup { bearer: id })?;
                    }
                }
            }
            state => unreachable!("setup dispatched for {id} in state {state}"),
        }
        Ok(())
    }

    fn admit(
        &mut self,
        context: &mut Context<Event>,
        id: BearerId,
        reservation: u32,
    ) -> Result<(), RuntimeError> {
        let now = context.current();
        let sequence = self.admissions;
        self.admissions += 1;
        let bearer = lookup_mut(&mut self.cell, id);
        let from = bearer.transition(State::Admitted, now);
        bearer.set_admission(sequence);
        bearer.set_readmissions(0);
        let epoch = bearer.start_traffic();
        self.monitor.forget(&id);
        self.metrics.admitted.inc();
        debug!(bearer = %id, reservation, "admitted");
        self.sink.record(Record::Transition {
            time: now,
            bearer: id,
            from,
            to: State::Admitted,
        });
        self.sink.record(Record::Admitted {
            time: now,
            bearer: id,
            reservation,
        });
        context.schedule(now, Event::Arrival { bearer: id, epoch })?;
        Ok(())
    }

    /// Ask for `needed` units on behalf of `requester`, evicting victims from `pool`.
    ///
    /// Returns whether enough was freed.
    fn preempt_for(
        &mut self,
        context: &mut Context<Event>,
        requester: BearerId,
        pool: Vec<(BearerId, u32)>,
        needed: u32,
        cause: Cause,
    ) -> Result<bool, RuntimeError> {
        let now = context.current();
        let Some(preemption) = &self.preemption else {
            return Ok(false);
        };
        let feedback = self.monitor.feedback();
        let bearer = lookup(&self.cell, requester);
        let requester_score = preemption.score(&self.cell, feedback, bearer, now);
        let victims: Vec<(BearerId, Score)> =
            match preemption.select(&self.cell, feedback, bearer, pool, needed, now) {
                Selection::Victims(victims) => victims
                    .into_iter()
                    .map(|victim| {
                        let score =
                            preemption.score(&self.cell, feedback, lookup(&self.cell, victim), now);
                        (victim, score)
                    })
                    .collect(),
                Selection::Deficit { missing } => {
                    warn!(bearer = %requester, ?cause, needed, missing, "unable to preempt");
                    self.sink.record(Record::Deficit {
                        time: now,
                        bearer: requester,
                        cause,
                        missing,
                    });
                    return Ok(false);
                }
            };
        for (victim, score) in victims {
            self.evict(context, victim, requester, cause, score, requester_score)?;
        }
        Ok(true)
    }

    fn evict(
        &mut self,
        context: &mut Context<Event>,
        victim: BearerId,
        by: BearerId,
        cause: Cause,
        score: Score,
        requester: Score,
    ) -> Result<(), RuntimeError> {
        let now = context.current();
        let stop = self.stop(victim);
        let bearer = lookup_mut(&mut self.cell, victim);
        let from = bearer.transition(State::Preempted, now);
        bearer.stop_traffic();
        bearer.set_readmissions(0);
        let lost = bearer.queue_mut().drain();
        self.metrics.preempted.inc();
        debug!(bearer = %victim, %by, ?cause, "preempted");
        self.sink.record(Record::Transition {
            time: now,
            bearer: victim,
            from,
            to: State::Preempted,
        });
        self.sink.record(Record::Preempted {
            time: now,
            bearer: victim,
            by,
            cause,
            score,
            requester,
        });
        self.lose(now, victim, lost, Loss::Preempted);

        match self.readmission {
            Some(readmission) if now.after(readmission.interval_ms) < stop => {
                context.schedule_after(readmission.interval_ms, Event::Setup { bearer: victim })?;
            }
            _ => self.finish(now, victim),
        }
        Ok(())
    }

    /// Move an active or preempted bearer to its terminal state.
    fn finish(&mut self, now: SimTime, id: BearerId) {
        let bearer = lookup_mut(&mut self.cell, id);
        bearer.stop_traffic();
        bearer.queue_mut().drain();
        let from = bearer.transition(State::Released, now);
        self.monitor.forget(&id);
        self.metrics.released.inc();
        debug!(bearer = %id, %from, "released");
        self.sink.record(Record::Transition {
            time: now,
            bearer: id,
            from,
            to: State::Released,
        });
        self.sink.record(Record::Released {
            time: now,
            bearer: id,
        });
    }

    /// Account for packets that will never be delivered.
    fn lose(&mut self, now: SimTime, id: BearerId, packets: Vec<Packet>, reason: Loss) {
        if packets.is_empty() {
            return;
        }
        let bearer = lookup_mut(&mut self.cell, id);
        let mut bits = 0;
        for packet in &packets {
            bits += packet.bits();
            self.monitor.dropped(id, now, packet.bits());
        }
        let count = packets.len() as u64;
        bearer.totals.dropped_packets += count;
        bearer.totals.dropped_bits += bits;
        self.metrics.packets_dropped.inc_by(count);
        trace!(bearer = %id, ?reason, packets = count, bits, "dropped");
        self.sink.record(Record::Dropped {
            time: now,
            bearer: id,
            reason,
            packets: count,
            bits,
        });
    }

    fn arrival(
        &mut self,
        context: &mut Context<Event>,
        id: BearerId,
        epoch: u32,
    ) -> Result<(), RuntimeError> {
        let now = context.current();
        let stop = self.stop(id);
        let bearer = lookup_mut(&mut self.cell, id);
        let packet = bearer.next_packet(now);
        let gap = bearer.next_gap();
        if let Err(packet) = bearer.queue_mut().push(packet) {
            self.lose(now, id, vec![packet], Loss::Overflow);
        }
        let next = now.after(gap);
        if next < stop {
            context.schedule(next, Event::Arrival { bearer: id, epoch })?;
        }
        Ok(())
    }

    fn delivery(&mut self, now: SimTime, id: BearerId, bits: u64, arrival: SimTime) {
        let delay = now.since(arrival);
        let bearer = lookup_mut(&mut self.cell, id);
        bearer.totals.delivered_packets += 1;
        bearer.totals.delivered_bits += bits;
        bearer.totals.delay += delay;
        self.monitor.delivered(id, now, bits, delay);
        self.metrics.packets_delivered.inc();
        trace!(bearer = %id, bits, delay, "delivered");
    }

    fn release(&mut self, now: SimTime, id: BearerId) {
        let bearer = lookup_mut(&mut self.cell, id);
        match bearer.state() {
            State::Requested => {
                bearer.close(now);
                debug!(bearer = %id, "request withdrawn");
            }
            State::Admitted => {
                // Never served: retire in place
                bearer.close(now);
                bearer.queue_mut().drain();
                self.monitor.forget(&id);
                self.metrics.released.inc();
                debug!(bearer = %id, "closed before service");
                self.sink.record(Record::Released {
                    time: now,
                    bearer: id,
                });
            }
            State::Active | State::Preempted => self.finish(now, id),
            State::Released => {}
        }
    }

    fn expire(&mut self, now: SimTime) {
        let expired: Vec<(BearerId, Vec<Packet>)> = self
            .cell
            .bearers_mut()
            .filter(|bearer| bearer.is_scheduled())
            .map(|bearer| (bearer.id(), bearer.queue_mut().expire(now)))
            .filter(|(_, packets)| !packets.is_empty())
            .collect();
        for (id, packets) in expired {
            self.lose(now, id, packets, Loss::Expired);
        }
    }

    fn round(&mut self, context: &mut Context<Event>) -> Result<(), RuntimeError> {
        let now = context.current();
        self.round += 1;
        self.metrics.rounds.inc();
        if self.scheduler.overflow() == Overflow::DropExpired {
            self.expire(now);
        }

        // Plan, preempting at most once if reservations starve the top-ranked bearer
        let demands = self
            .scheduler
            .demands(&self.cell, self.monitor.feedback(), now);
        let mut plan = self.scheduler.plan(&demands);
        if let Some(exhaustion) = plan.exhaustion {
            self.metrics.exhausted_rounds.inc();
            debug!(
                round = self.round,
                bearer = %exhaustion.bearer,
                deficit = exhaustion.deficit,
                "reservations exhausted"
            );
            self.sink.record(Record::Exhausted {
                time: now,
                round: self.round,
                bearer: exhaustion.bearer,
                deficit: exhaustion.deficit,
            });
            let can_preempt = lookup(&self.cell, exhaustion.bearer).profile().can_preempt;
            if can_preempt && self.preemption.is_some() {
                let pool = plan
                    .grants
                    .iter()
                    .filter(|grant| grant.bearer != exhaustion.bearer)
                    .map(|grant| (grant.bearer, grant.units))
                    .collect();
                if self.preempt_for(
                    context,
                    exhaustion.bearer,
                    pool,
                    exhaustion.deficit,
                    Cause::Exhaustion,
                )? {
                    let demands = self
                        .scheduler
                        .demands(&self.cell, self.monitor.feedback(), now);
                    plan = self.scheduler.plan(&demands);
                }
            }
        }
        plan.assert_within(self.scheduler.capacity());

        // Transmit
        let mut sent = BTreeMap::new();
        for (position, grant) in plan.grants.iter().enumerate() {
            let efficiency = self.cell.efficiency(grant.bearer);
            let failed = self.error_rate > 0.0 && context.gen::<f64>() < self.error_rate;
            let bearer = lookup_mut(&mut self.cell, grant.bearer);
            if bearer.state() == State::Admitted {
                bearer.transition(State::Active, now);
                self.sink.record(Record::Transition {
                    time: now,
                    bearer: grant.bearer,
                    from: State::Admitted,
                    to: State::Active,
                });
            }
            bearer.served(now, position as u32, grant.units);
            self.metrics.allocated_units.inc_by(grant.units as u64);
            if failed {
                trace!(bearer = %grant.bearer, units = grant.units, "transmission failed");
                continue;
            }
            let bits = (grant.units as u64 * efficiency as u64).min(bearer.queue().pending());
            sent.insert(grant.bearer, bits);
            for packet in bearer.queue_mut().transmit(bits) {
                context.schedule_after(
                    self.tx_delay,
                    Event::Delivery {
                        bearer: grant.bearer,
                        bits: packet.bits(),
                        arrival: packet.arrival,
                    },
                )?;
            }
        }

        // Fold this round into every scheduled bearer's achieved rate
        let interval = self.scheduler.interval();
        for bearer in self.cell.bearers_mut().filter(|bearer| bearer.is_scheduled()) {
            let bits = sent.get(&bearer.id()).copied().unwrap_or(0);
            bearer.update_rate(bits, interval);
        }

        trace!(round = self.round, used = plan.used, grants = plan.grants.len(), "allocated");
        self.sink.record(Record::Allocation {
            time: now,
            round: self.round,
            capacity: self.scheduler.capacity(),
            used: plan.used,
            grants: plan.grants,
        });
        context.schedule_after(interval, Event::Round)?;
        Ok(())
    }

    fn channel(&mut self, context: &mut Context<Event>) -> Result<(), RuntimeError> {
        for index in 0..self.cell.terminals().len() {
            let draw = context.gen::<f64>();
            let step = if draw < self.variation / 2.0 {
                -1
            } else if draw < self.variation {
                1
            } else {
                continue;
            };
            let cqi = self.cell.terminals()[index].cqi();
            let next = self.cell.channel().clamp(cqi as i32 + step);
            self.cell.terminals_mut()[index].set_cqi(next);
            trace!(terminal = %TerminalId(index as u32), from = cqi, to = next, "channel updated");
        }
        context.schedule_after(self.update_interval, Event::Channel)?;
        Ok(())
    }

    fn monitor(&mut self, context: &mut Context<Event>) -> Result<(), RuntimeError> {
        let now = context.current();
        let subjects: Vec<Subject<'_>> = self
            .cell
            .bearers()
            .filter(|bearer| bearer.is_scheduled())
            .map(|bearer| Subject {
                bearer: bearer.id(),
                requirement: bearer.requirement(),
                admitted: bearer.admitted_at().unwrap_or(now),
                backlogged: bearer.queue().pending() > 0,
            })
            .collect();
        let reports = self.monitor.tick(now, &subjects);
        for (bearer, report) in reports {
            self.sink.record(Record::Sample {
                time: now,
                bearer,
                sample: report.sample,
            });
            if !report.is_violated() {
                continue;
            }
            self.metrics.violations.inc();
            warn!(%bearer, violations = ?report.violations, "QoS violation");
            self.sink.record(Record::Violation {
                time: now,
                bearer,
                violations: report.violations,
            });

            // Enforcement runs after this tick has been published
            if self.qos_triggered && self.preemption.is_some() {
                context.schedule(now, Event::Enforce { bearer })?;
            }
        }
        context.schedule_after(self.monitor_interval, Event::Monitor)?;
        Ok(())
    }

    fn enforce(&mut self, context: &mut Context<Event>, id: BearerId) -> Result<(), RuntimeError> {
        let Some(report) = self.monitor.feedback().get(&id) else {
            return Ok(());
        };
        let bearer = lookup(&self.cell, id);
        if !report.is_violated() || !bearer.profile().can_preempt {
            return Ok(());
        }

        // Units that would close the throughput gap (at least one)
        let shortfall = report
            .violations
            .iter()
            .filter_map(|violation| match violation {
                Violation::Throughput {
                    observed,
                    guaranteed,
                } => Some((*guaranteed as f64 - observed).max(0.0).ceil() as u64),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        let bits = round_bits(shortfall, self.scheduler.interval());
        let needed = units(bits, self.cell.efficiency(id)).clamp(1, u32::MAX as u64) as u32;
        let pool = self
            .cell
            .bearers()
            .map(|bearer| (bearer.id(), bearer.last_grant()))
            .collect();
        self.preempt_for(context, id, pool, needed, Cause::Qos)?;
        Ok(())
    }
}

impl<S: Sink> Handler for Simulation<S> {
    type Event = Event;

    fn is_live(&self, event: &Event) -> bool {
        let Some(id) = event.bearer() else {
            return true;
        };
        let Some(bearer) = self.cell.bearer(id) else {
            return false;
        };
        match event {
            Event::Setup { .. } => match bearer.state() {
                State::Requested => !bearer.is_closed(),
                State::Preempted => true,
                _ => false,
            },
            Event::Arrival { epoch, .. } => bearer.is_generating(*epoch),
            Event::Delivery { .. } | Event::Release { .. } => bearer.state() != State::Released,
            Event::Enforce { .. } => bearer.state() == State::Active,
            Event::Round | Event::Channel | Event::Monitor => true,
        }
    }

    fn handle(&mut self, context: &mut Context<Event>, event: Event) -> Result<(), RuntimeError> {
        match event {
            Event::Setup { bearer } => self.setup(context, bearer),
            Event::Arrival { bearer, epoch } => self.arrival(context, bearer, epoch),
            Event::Delivery {
                bearer,
                bits,
                arrival,
            } => {
                self.delivery(context.current(), bearer, bits, arrival);
                Ok(())
            }
            Event::Release { bearer } => {
                self.release(context.current(), bearer);
                Ok(())
            }
            Event::Round => self.round(context),
            Event::Channel => self.channel(context),
            Event::Monitor => self.monitor(context),
            Event::Enforce { bearer } => self.enforce(context, bearer),
        }
    }
}
