//! Scenario configuration.
//!
//! A scenario is a YAML document. Optional sections fall back to their defaults and
//! every policy selector is a kebab-case enum, so a misspelled selector fails to parse.
//! [Config::from_yaml] parses and validates in one step; a simulation never starts on a
//! configuration that failed [Config::validate].
//!
//! ```yaml
//! seed: 7
//! duration_ms: 10000
//! grid:
//!   capacity: 50
//! priority_policy: proportional-fair
//! access_control:
//!   policy: fixed-capacity
//!   limit: 8
//! terminals:
//!   - cqi: 10
//!     bearers:
//!       - qci: 9
//!         packet_size: { kind: constant, value: 1000 }
//!         inter_arrival_ms: { kind: exponential, mean: 20 }
//! ```

use crate::{
    access::Kind,
    amc::ChannelModel,
    preemption::{Ranking, Readmission},
    priority::Policy,
    profile::ApplicationProfile,
    scheduler::Overflow,
    BearerId, Error, TerminalId,
};
use serde::Deserialize;

/// Limits of the event kernel.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Engine {
    /// Events that may be dispatched at one timestamp before the run is declared stalled.
    pub max_events_per_instant: u64,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            max_events_per_instant: 100_000,
        }
    }
}

fn one() -> u64 {
    1
}

/// The shared resource grid.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Grid {
    /// Resource units available in each round.
    pub capacity: u32,

    /// Milliseconds between scheduling rounds.
    #[serde(default = "one")]
    pub round_interval_ms: u64,
}

/// Channel quality model and its variation over time.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Channel {
    /// Bits per resource unit for each indicator (the standard table when omitted).
    pub table: Option<Vec<u32>>,

    /// Probability that an update moves a terminal's indicator by one step.
    pub variation: f64,

    /// Milliseconds between channel updates.
    pub update_interval_ms: u64,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            table: None,
            variation: 0.0,
            update_interval_ms: 100,
        }
    }
}

/// Admission control.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Access {
    pub policy: Kind,

    /// Maximum number of admitted bearers (only used by `fixed-capacity`).
    pub limit: Option<usize>,

    /// Milliseconds before a queued request is retried.
    pub retry_interval_ms: u64,
}

impl Default for Access {
    fn default() -> Self {
        Self {
            policy: Kind::default(),
            limit: None,
            retry_interval_ms: 100,
        }
    }
}

/// Preemption of lower-ranked bearers.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Preemption {
    pub enabled: bool,

    /// Policy used to score requesters and victims.
    pub ranking: Ranking,

    /// Whether QoS violations reported by the monitor trigger preemption.
    pub qos_triggered: bool,

    /// Re-admission of preempted bearers (released immediately when absent).
    pub readmission: Option<Readmission>,
}

impl Default for Preemption {
    fn default() -> Self {
        Self {
            enabled: false,
            ranking: Ranking::StrictPriority,
            qos_triggered: false,
            readmission: None,
        }
    }
}

/// QoS monitoring cadence.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Monitor {
    /// Milliseconds between monitoring ticks.
    pub interval_ms: u64,

    /// Length of the sliding measurement window in milliseconds.
    pub window_ms: u64,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            window_ms: 1_000,
        }
    }
}

/// Largest per-bearer queue, in bytes (one tebibyte).
pub const MAX_QUEUE_BYTES: u64 = 1 << 40;

/// Transmission of granted bits.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Transmission {
    /// Milliseconds between a packet's last bit being sent and its delivery.
    pub tx_delay_ms: u64,

    /// Probability that a grant's transmission fails and must be repeated.
    pub error_rate: f64,

    /// Per-bearer queue size in bytes.
    pub queue_bytes: u64,

    /// Network overhead added to every packet, in bytes.
    pub overhead_bytes: u64,

    pub overflow: Overflow,
}

impl Default for Transmission {
    fn default() -> Self {
        Self {
            tx_delay_ms: 4,
            error_rate: 0.0,
            queue_bytes: 10_000,
            overhead_bytes: 30,
            overflow: Overflow::default(),
        }
    }
}

/// A user terminal and its bearers.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Terminal {
    /// Initial channel-quality indicator (clamped into the table).
    pub cqi: u8,
    pub bearers: Vec<ApplicationProfile>,
}

/// A complete scenario.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub seed: u64,

    /// Simulated time in milliseconds.
    pub duration_ms: u64,

    #[serde(default)]
    pub engine: Engine,
    pub grid: Grid,
    #[serde(default)]
    pub channel: Channel,
    pub priority_policy: Policy,
    #[serde(default)]
    pub access_control: Access,
    #[serde(default)]
    pub preemption: Preemption,
    #[serde(default)]
    pub qos_monitor: Monitor,
    #[serde(default)]
    pub transmission: Transmission,
    pub terminals: Vec<Terminal>,
}

impl Config {
    /// Parse and validate a YAML scenario.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// The channel model described by the `channel` section.
    pub fn channel_model(&self) -> Result<ChannelModel, Error> {
        match &self.channel.table {
            Some(table) => ChannelModel::new(table.clone()),
            None => Ok(ChannelModel::default()),
        }
    }

    /// When `profile` stops generating traffic (the end of the run unless set).
    pub fn stop_ms(&self, profile: &ApplicationProfile) -> u64 {
        profile.stop_ms.unwrap_or(self.duration_ms)
    }

    /// Check every bound, returning the first violation.
    pub fn validate(&self) -> Result<(), Error> {
        if self.duration_ms == 0 {
            return Err(Error::InvalidDuration);
        }
        if self.engine.max_events_per_instant == 0 {
            return Err(Error::InvalidEventCap);
        }

        // Grid and channel
        if self.grid.capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        if self.grid.round_interval_ms == 0 {
            return Err(Error::InvalidInterval("grid.round_interval_ms"));
        }
        self.channel_model()?;
        probability("channel.variation", self.channel.variation, true)?;
        if self.channel.update_interval_ms == 0 {
            return Err(Error::InvalidInterval("channel.update_interval_ms"));
        }

        // Policies
        if self.access_control.policy == Kind::FixedCapacity
            && !self.access_control.limit.is_some_and(|limit| limit > 0)
        {
            return Err(Error::InvalidLimit);
        }
        if self.access_control.retry_interval_ms == 0 {
            return Err(Error::InvalidInterval("access_control.retry_interval_ms"));
        }
        if let Some(readmission) = &self.preemption.readmission {
            if readmission.attempts == 0 {
                return Err(Error::InvalidReadmission);
            }
            if readmission.interval_ms == 0 {
                return Err(Error::InvalidInterval("preemption.readmission.interval_ms"));
            }
        }
        if self.qos_monitor.interval_ms == 0 {
            return Err(Error::InvalidInterval("qos_monitor.interval_ms"));
        }
        if self.qos_monitor.window_ms == 0 {
            return Err(Error::InvalidInterval("qos_monitor.window_ms"));
        }
        probability("transmission.error_rate", self.transmission.error_rate, false)?;
        if self.transmission.queue_bytes > MAX_QUEUE_BYTES {
            return Err(Error::InvalidQueue(self.transmission.queue_bytes));
        }

        // Terminals and their bearers
        if self.terminals.is_empty() {
            return Err(Error::NoTerminals);
        }
        for (terminal, config) in self.terminals.iter().enumerate() {
            let terminal = terminal as u32;
            if config.bearers.len() > u16::MAX as usize + 1 {
                return Err(Error::TooManyBearers(TerminalId(terminal)));
            }
            for (index, profile) in config.bearers.iter().enumerate() {
                profile.validate()?;
                let bearer = BearerId::new(terminal, index as u16);

                // Float-to-integer casts saturate
                let size = (profile.packet_size.scale().round() as u64)
                    .saturating_add(self.transmission.overhead_bytes);
                if size > self.transmission.queue_bytes {
                    return Err(Error::OversizedPacket {
                        bearer,
                        size,
                        queue: self.transmission.queue_bytes,
                    });
                }
                let stop = self.stop_ms(profile);
                if profile.start_ms >= stop || stop > self.duration_ms {
                    return Err(Error::InvalidWindow {
                        bearer,
                        start: profile.start_ms,
                        stop,
                    });
                }
            }
        }
        Ok(())
    }
}

fn probability(field: &'static str, value: f64, inclusive: bool) -> Result<(), Error> {
    let valid = if inclusive {
        (0.0..=1.0).contains(&value)
    } else {
        (0.0..1.0).contains(&value)
    };
    if !valid {
        return Err(Error::InvalidProbability { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Distribution;
    use test_case::test_case;

    const MINIMAL: &str = r#"
duration_ms: 1000
grid:
  capacity: 10
priority_policy: round-robin
terminals:
  - cqi: 7
    bearers:
      - qci: 9
        packet_size: { kind: constant, value: 500 }
        inter_arrival_ms: { kind: uniform, low: 5, high: 15 }
"#;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.seed, 0);
        assert_eq!(config.grid.round_interval_ms, 1);
        assert_eq!(config.engine.max_events_per_instant, 100_000);
        assert_eq!(config.channel_model().unwrap(), ChannelModel::default());
        assert_eq!(config.access_control.policy, Kind::AdmitAll);
        assert_eq!(config.access_control.retry_interval_ms, 100);
        assert!(!config.preemption.enabled);
        assert_eq!(config.preemption.ranking, Ranking::StrictPriority);
        assert_eq!(config.qos_monitor.window_ms, 1_000);
        assert_eq!(config.transmission.tx_delay_ms, 4);
        assert_eq!(config.transmission.overhead_bytes, 30);
        assert_eq!(config.transmission.overflow, Overflow::CarryOver);

        let profile = &config.terminals[0].bearers[0];
        assert!(profile.preemptible);
        assert_eq!(
            profile.inter_arrival_ms,
            Distribution::Uniform {
                low: 5.0,
                high: 15.0
            }
        );
        assert_eq!(config.stop_ms(profile), 1_000);
    }

    #[test]
    fn test_full_sections() {
        let yaml = r#"
seed: 3
duration_ms: 500
engine: { max_events_per_instant: 10 }
grid: { capacity: 25, round_interval_ms: 2 }
channel: { table: [10, 20, 30], variation: 0.2, update_interval_ms: 50 }
priority_policy: deadline-aware
access_control: { policy: fixed-capacity, limit: 3, retry_interval_ms: 20 }
preemption:
  enabled: true
  ranking: proportional-fair
  qos_triggered: true
  readmission: { interval_ms: 40, attempts: 2 }
qos_monitor: { interval_ms: 100, window_ms: 200 }
transmission: { tx_delay_ms: 1, error_rate: 0.1, queue_bytes: 4000, overhead_bytes: 0, overflow: drop-expired }
terminals:
  - cqi: 2
    bearers:
      - qci: 1
        guaranteed_bitrate: 64000
        max_bitrate: 128000
        can_preempt: false
        packet_size: { kind: normal, mean: 200, std_dev: 20 }
        inter_arrival_ms: { kind: constant, value: 20 }
        session:
          packets: { kind: constant, value: 10 }
          gap_ms: { kind: exponential, mean: 100 }
        start_ms: 10
        stop_ms: 400
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.seed, 3);
        assert_eq!(config.preemption.ranking, Ranking::ProportionalFair);
        assert_eq!(config.channel_model().unwrap().worst_case(), 10);
        assert_eq!(config.access_control.limit, Some(3));
        assert_eq!(
            config.preemption.readmission,
            Some(Readmission {
                interval_ms: 40,
                attempts: 2
            })
        );
        assert_eq!(config.transmission.overflow, Overflow::DropExpired);
        let profile = &config.terminals[0].bearers[0];
        assert!(!profile.can_preempt);
        assert_eq!(config.stop_ms(profile), 400);
    }

    #[test_case("priority_policy: round-robin", "priority_policy: fifo"; "unknown priority policy")]
    #[test_case("grid:", "access_control: { policy: lottery }\ngrid:"; "unknown access policy")]
    #[test_case("duration_ms: 1000", "duration_ms: -5"; "negative duration")]
    #[test_case("capacity: 10", "capacity: -1"; "negative capacity")]
    fn test_parse_errors(from: &str, to: &str) {
        let yaml = MINIMAL.replacen(from, to, 1);
        assert!(matches!(Config::from_yaml(&yaml), Err(Error::Parse(_))));
    }

    fn invalid(from: &str, to: &str) -> Error {
        let yaml = MINIMAL.replacen(from, to, 1);
        Config::from_yaml(&yaml).unwrap_err()
    }

    #[test]
    fn test_validation_errors() {
        assert!(matches!(
            invalid("duration_ms: 1000", "duration_ms: 0"),
            Error::InvalidDuration
        ));
        assert!(matches!(
            invalid("capacity: 10", "capacity: 0"),
            Error::InvalidCapacity
        ));
        assert!(matches!(
            invalid("capacity: 10", "capacity: 10\n  round_interval_ms: 0"),
            Error::InvalidInterval("grid.round_interval_ms")
        ));
        assert!(matches!(
            invalid("grid:", "engine: { max_events_per_instant: 0 }\ngrid:"),
            Error::InvalidEventCap
        ));
        assert!(matches!(
            invalid("grid:", "channel: { table: [5, 3] }\ngrid:"),
            Error::InvalidChannelTable(_)
        ));
        assert!(matches!(
            invalid("grid:", "channel: { variation: 1.5 }\ngrid:"),
            Error::InvalidProbability {
                field: "channel.variation",
                ..
            }
        ));
        assert!(matches!(
            invalid("grid:", "transmission: { error_rate: 1.0 }\ngrid:"),
            Error::InvalidProbability {
                field: "transmission.error_rate",
                ..
            }
        ));
        assert!(matches!(
            invalid("grid:", "access_control: { policy: fixed-capacity }\ngrid:"),
            Error::InvalidLimit
        ));
        assert!(matches!(
            invalid(
                "grid:",
                "preemption: { readmission: { interval_ms: 5, attempts: 0 } }\ngrid:"
            ),
            Error::InvalidReadmission
        ));
        assert!(matches!(
            invalid("grid:", "qos_monitor: { window_ms: 0 }\ngrid:"),
            Error::InvalidInterval("qos_monitor.window_ms")
        ));
        assert!(matches!(
            invalid("qci: 9", "qci: 12"),
            Error::InvalidQci(12)
        ));
        assert!(matches!(
            invalid("value: 500", "value: -500"),
            Error::InvalidDistribution {
                field: "packet_size",
                ..
            }
        ));
        assert!(matches!(
            invalid("qci: 9", "qci: 9\n        stop_ms: 2000"),
            Error::InvalidWindow { stop: 2_000, .. }
        ));
        assert!(matches!(
            invalid("qci: 9", "qci: 9\n        start_ms: 1000"),
            Error::InvalidWindow { start: 1_000, .. }
        ));
        assert!(matches!(
            invalid("qci: 9", "qci: 9\n        guaranteed_bitrate: 100\n        max_bitrate: 50"),
            Error::InvalidBitrate {
                guaranteed: 100,
                max: 50
            }
        ));
    }

    #[test]
    fn test_packet_size_bounds() {
        assert!(matches!(
            invalid("value: 500", "value: 3.0e18"),
            Error::OversizedPacket {
                size: 3_000_000_000_000_000_030,
                queue: 10_000,
                ..
            }
        ));
        assert!(matches!(
            invalid("value: 500", "value: 9990"),
            Error::OversizedPacket { size: 10_020, .. }
        ));
        assert!(matches!(
            invalid(
                "packet_size: { kind: constant, value: 500 }",
                "packet_size: { kind: normal, mean: 500, std_dev: 1.0e19 }"
            ),
            Error::OversizedPacket { .. }
        ));
        assert!(matches!(
            invalid("grid:", "transmission: { queue_bytes: 2000000000000 }\ngrid:"),
            Error::InvalidQueue(2_000_000_000_000)
        ));

        // A packet that exactly fills the queue is accepted
        let yaml = MINIMAL.replacen("value: 500", "value: 9970", 1);
        assert!(Config::from_yaml(&yaml).is_ok());
    }

    #[test]
    fn test_no_terminals() {
        let yaml = r#"
duration_ms: 1000
grid: { capacity: 10 }
priority_policy: strict-priority
terminals: []
"#;
        assert!(matches!(Config::from_yaml(yaml), Err(Error::NoTerminals)));
    }
}
