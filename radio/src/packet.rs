//! Packets and the bounded per-bearer transmit queue.

use crate::BearerId;
use qosim_runtime::SimTime;
use std::collections::VecDeque;

/// One application packet waiting for (or in) transmission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub bearer: BearerId,
    pub sequence: u64,

    /// Size in bytes, including network overhead.
    pub size: u64,
    pub arrival: SimTime,

    /// Latest acceptable delivery time.
    pub deadline: SimTime,

    /// Bits already transmitted.
    sent: u64,
}

impl Packet {
    pub fn new(bearer: BearerId, sequence: u64, size: u64, arrival: SimTime, budget: u64) -> Self {
        Self {
            bearer,
            sequence,
            size,
            arrival,
            deadline: arrival.after(budget),
            sent: 0,
        }
    }

    pub fn bits(&self) -> u64 {
        self.size.saturating_mul(8)
    }

    /// Bits not yet transmitted.
    pub fn remaining(&self) -> u64 {
        self.bits() - self.sent
    }

    /// Milliseconds left before the deadline (negative once it has passed).
    pub fn budget_left(&self, now: SimTime) -> f64 {
        self.deadline.as_millis() as f64 - now.as_millis() as f64
    }
}

/// FIFO of packets bounded by total bytes.
#[derive(Debug)]
pub struct Queue {
    packets: VecDeque<Packet>,
    capacity: u64,
    used: u64,
    pending: u64,
}

impl Queue {
    /// Create a queue that holds at most `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            packets: VecDeque::new(),
            capacity,
            used: 0,
            pending: 0,
        }
    }

    /// Enqueue `packet`, handing it back if it does not fit.
    pub fn push(&mut self, packet: Packet) -> Result<(), Packet> {
        match self.used.checked_add(packet.size) {
            Some(used) if used <= self.capacity => self.used = used,
            _ => return Err(packet),
        }
        self.pending = self.pending.saturating_add(packet.remaining());
        self.packets.push_back(packet);
        Ok(())
    }

    /// Bits waiting for transmission.
    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// The packet at the head of the queue.
    pub fn oldest(&self) -> Option<&Packet> {
        self.packets.front()
    }

    /// Send up to `bits` from the head of the queue.
    ///
    /// Returns the packets whose last bit was sent. Unused bits are discarded.
    pub fn transmit(&mut self, mut bits: u64) -> Vec<Packet> {
        let mut completed = Vec::new();
        while bits > 0 {
            let Some(head) = self.packets.front_mut() else {
                break;
            };
            let sent = bits.min(head.remaining());
            head.sent += sent;
            bits -= sent;
            self.pending -= sent;
            if head.remaining() > 0 {
                break;
            }
            if let Some(packet) = self.packets.pop_front() {
                self.used -= packet.size;
                completed.push(packet);
            }
        }
        completed
    }

    /// Remove packets whose deadline is at or before `now`.
    pub fn expire(&mut self, now: SimTime) -> Vec<Packet> {
        let (expired, kept): (Vec<_>, Vec<_>) =
            self.packets.drain(..).partition(|packet| packet.deadline <= now);
        self.packets = kept.into();
        for packet in &expired {
            self.used -= packet.size;
            self.pending -= packet.remaining();
        }
        expired
    }

    /// Remove every packet.
    pub fn drain(&mut self) -> Vec<Packet> {
        self.used = 0;
        self.pending = 0;
        self.packets.drain(..).collect()
    }
}
