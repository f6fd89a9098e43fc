//! Application traffic profiles and the generators built from them.
//!
//! An [ApplicationProfile] pairs traffic-generation parameters (packet size and
//! inter-arrival distributions, optionally grouped into sessions) with the QoS
//! requirement of the flow. A [Generator] turns a profile into a stream of packet sizes
//! and gaps drawn from its own seeded source.

use crate::{
    qos::{QosClass, Requirement},
    Error,
};
use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution as _, Exp, Normal};
use serde::Deserialize;

/// A non-negative random quantity.
///
/// Samples below zero are clamped to zero. Whole-number consumers (bytes, milliseconds)
/// round to the nearest integer.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Distribution {
    Constant { value: f64 },
    Uniform { low: f64, high: f64 },
    Exponential { mean: f64 },
    Normal { mean: f64, std_dev: f64 },
}

impl Distribution {
    /// Build a sampler, rejecting parameters that cannot produce a valid draw.
    pub fn sampler(&self, field: &'static str) -> Result<Sampler, Error> {
        let invalid = |reason: &str| Error::InvalidDistribution {
            field,
            reason: reason.to_string(),
        };
        match *self {
            Self::Constant { value } => {
                if !value.is_finite() || value < 0.0 {
                    return Err(invalid("value must be finite and non-negative"));
                }
                Ok(Sampler::Constant(value))
            }
            Self::Uniform { low, high } => {
                if !low.is_finite() || !high.is_finite() || low < 0.0 || low > high {
                    return Err(invalid("bounds must be finite with 0 <= low <= high"));
                }
                Ok(Sampler::Uniform(Uniform::new_inclusive(low, high)))
            }
            Self::Exponential { mean } => {
                if !mean.is_finite() || mean <= 0.0 {
                    return Err(invalid("mean must be finite and positive"));
                }
                Exp::new(1.0 / mean)
                    .map(Sampler::Exponential)
                    .map_err(|err| invalid(&err.to_string()))
            }
            Self::Normal { mean, std_dev } => {
                if !mean.is_finite() || !std_dev.is_finite() || std_dev < 0.0 {
                    return Err(invalid("mean and std_dev must be finite, std_dev >= 0"));
                }
                Normal::new(mean, std_dev)
                    .map(Sampler::Normal)
                    .map_err(|err| invalid(&err.to_string()))
            }
        }
    }

    /// A value draws are bounded by (constant, uniform) or rarely exceed (exponential and
    /// normal, at three standard deviations).
    pub fn scale(&self) -> f64 {
        match *self {
            Self::Constant { value } => value,
            Self::Uniform { high, .. } => high,
            Self::Exponential { mean } => 3.0 * mean,
            Self::Normal { mean, std_dev } => mean + 3.0 * std_dev,
        }
    }
}

/// A validated [Distribution], ready to draw from.
#[derive(Clone, Debug)]
pub enum Sampler {
    Constant(f64),
    Uniform(Uniform<f64>),
    Exponential(Exp<f64>),
    Normal(Normal<f64>),
}

impl Sampler {
    /// Draw a non-negative sample.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        let value = match self {
            Self::Constant(value) => *value,
            Self::Uniform(uniform) => uniform.sample(rng),
            Self::Exponential(exp) => exp.sample(rng),
            Self::Normal(normal) => normal.sample(rng),
        };
        value.max(0.0)
    }

    /// Draw a sample rounded to the nearest whole number.
    pub fn sample_whole<R: Rng>(&self, rng: &mut R) -> u64 {
        self.sample(rng).round() as u64
    }
}

/// Packets grouped into bursts separated by a longer gap.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Session {
    /// Number of packets in each session.
    pub packets: Distribution,

    /// Gap after the last packet of a session, in milliseconds.
    pub gap_ms: Distribution,
}

fn yes() -> bool {
    true
}

/// Allocation and retention priority of a profile that does not set one.
pub const DEFAULT_ARP: u8 = 11;

/// Least important allocation and retention priority.
pub const MAX_ARP: u8 = 15;

fn default_arp() -> u8 {
    DEFAULT_ARP
}

/// Traffic and QoS parameters of one bearer, immutable once attached.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ApplicationProfile {
    /// QoS class identifier (1 through 9).
    pub qci: u8,

    /// Guaranteed bitrate in bits per second (zero for a best-effort bearer).
    #[serde(default)]
    pub guaranteed_bitrate: u64,

    /// Maximum bitrate in bits per second.
    #[serde(default)]
    pub max_bitrate: Option<u64>,

    /// Overrides the class packet delay budget (milliseconds).
    #[serde(default)]
    pub max_delay_ms: Option<u64>,

    /// Overrides the class packet loss target.
    #[serde(default)]
    pub max_loss: Option<f64>,

    /// Whether this bearer may be evicted to make room for others.
    #[serde(default = "yes")]
    pub preemptible: bool,

    /// Whether this bearer may evict others.
    #[serde(default = "yes")]
    pub can_preempt: bool,

    /// Allocation and retention priority, from 1 (most important) to 15.
    ///
    /// Independent of the QoS class priority level; only the eviction ranking reads it.
    #[serde(default = "default_arp")]
    pub arp: u8,

    /// Application payload size in bytes.
    pub packet_size: Distribution,

    /// Gap between packets in milliseconds.
    pub inter_arrival_ms: Distribution,

    #[serde(default)]
    pub session: Option<Session>,

    /// When the bearer is requested.
    #[serde(default)]
    pub start_ms: u64,

    /// When traffic ends and the bearer is released (defaults to the end of the run).
    #[serde(default)]
    pub stop_ms: Option<u64>,
}

impl ApplicationProfile {
    /// A best-effort constant-bit-rate profile, handy for building scenarios in code.
    pub fn constant(qci: u8, packet_size: f64, inter_arrival_ms: f64) -> Self {
        Self {
            qci,
            guaranteed_bitrate: 0,
            max_bitrate: None,
            max_delay_ms: None,
            max_loss: None,
            preemptible: true,
            can_preempt: true,
            arp: DEFAULT_ARP,
            packet_size: Distribution::Constant { value: packet_size },
            inter_arrival_ms: Distribution::Constant {
                value: inter_arrival_ms,
            },
            session: None,
            start_ms: 0,
            stop_ms: None,
        }
    }

    /// Resolve the QoS requirement from the class table and any overrides.
    pub fn requirement(&self) -> Result<Requirement, Error> {
        let class = QosClass::lookup(self.qci).ok_or(Error::InvalidQci(self.qci))?;
        if let Some(max) = self.max_bitrate {
            if max < self.guaranteed_bitrate {
                return Err(Error::InvalidBitrate {
                    guaranteed: self.guaranteed_bitrate,
                    max,
                });
            }
        }
        let max_loss = self.max_loss.unwrap_or(class.loss_rate);
        if !(0.0..=1.0).contains(&max_loss) {
            return Err(Error::InvalidProbability {
                field: "max_loss",
                value: max_loss,
            });
        }
        Ok(Requirement {
            class,
            guaranteed_bitrate: self.guaranteed_bitrate,
            max_bitrate: self.max_bitrate,
            max_delay: self.max_delay_ms.unwrap_or(class.delay_budget),
            max_loss,
        })
    }

    /// Check every parameter without drawing.
    pub fn validate(&self) -> Result<(), Error> {
        if !(1..=MAX_ARP).contains(&self.arp) {
            return Err(Error::InvalidArp(self.arp));
        }
        self.requirement()?;
        Generator::new(self, 0, 0)?;
        Ok(())
    }
}

/// Draws packet sizes and gaps for one bearer.
pub struct Generator {
    rng: StdRng,
    overhead: u64,
    packet_size: Sampler,
    inter_arrival: Sampler,
    session: Option<(Sampler, Sampler)>,
    remaining: Option<u64>,
}

impl Generator {
    /// Build a generator for `profile`, adding `overhead` bytes to every packet.
    pub fn new(profile: &ApplicationProfile, overhead: u64, seed: u64) -> Result<Self, Error> {
        let session = match &profile.session {
            Some(session) => Some((
                session.packets.sampler("session.packets")?,
                session.gap_ms.sampler("session.gap_ms")?,
            )),
            None => None,
        };
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            overhead,
            packet_size: profile.packet_size.sampler("packet_size")?,
            inter_arrival: profile.inter_arrival_ms.sampler("inter_arrival_ms")?,
            session,
            remaining: None,
        })
    }

    /// Size in bytes (including overhead) of the next packet.
    pub fn next_size(&mut self) -> u64 {
        self.packet_size
            .sample_whole(&mut self.rng)
            .saturating_add(self.overhead)
    }

    /// Milliseconds until the packet after the one just generated.
    pub fn next_gap(&mut self) -> u64 {
        let Some((packets, gap)) = &self.session else {
            return self.inter_arrival.sample_whole(&mut self.rng);
        };

        // Count down the current session, drawing its length on first use
        let remaining = match self.remaining {
            Some(remaining) => remaining,
            None => packets.sample_whole(&mut self.rng).max(1),
        };
        let remaining = remaining - 1;
        if remaining == 0 {
            self.remaining = None;
            gap.sample_whole(&mut self.rng)
        } else {
            self.remaining = Some(remaining);
            self.inter_arrival.sample_whole(&mut self.rng)
        }
    }
}
