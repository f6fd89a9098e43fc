//! Compare scheduling policies on a simulated cell.
//!
//! Load a scenario, run it once per selected priority policy, and report one summary
//! row per run. Observation records can be streamed to a JSON-lines file.

use qosim_radio::{
    config::Config,
    priority::Policy,
    simulation::{self, Outcome},
    stats::Summary,
    trace::{Record, Sink},
};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Errors that can occur when running the estimator.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown policy: {0}")]
    UnknownPolicy(String),
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("trace error: {0}")]
    Trace(#[from] io::Error),
    #[error("simulation error: {0}")]
    Simulation(#[from] qosim_radio::Error),
}

pub fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Resolve a policy selector (a policy name or `all`).
///
/// `all` runs every policy in [Policy::ALL] order.
pub fn policies(selector: &str) -> Result<Vec<Policy>, Error> {
    if selector == "all" {
        return Ok(Policy::ALL.to_vec());
    }
    selector
        .parse()
        .map(|policy| vec![policy])
        .map_err(|_| Error::UnknownPolicy(selector.to_string()))
}

/// Read and validate a scenario file.
pub fn load(path: &Path) -> Result<Config, Error> {
    let yaml = fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Config::from_yaml(&yaml)?)
}

/// Run `config` under `policy`, optionally overriding its seed.
pub fn evaluate<S: Sink>(
    config: &Config,
    policy: Policy,
    seed: Option<u64>,
    sink: S,
) -> Result<Outcome<S>, Error> {
    let mut config = config.clone();
    config.priority_policy = policy;
    if let Some(seed) = seed {
        config.seed = seed;
    }
    Ok(simulation::run(&config, sink)?)
}

/// Where the trace of `policy` is written when `runs` policies share `base`.
///
/// A single run writes to `base` itself; otherwise the policy name is appended.
pub fn trace_path(base: &Path, policy: Policy, runs: usize) -> PathBuf {
    if runs <= 1 {
        return base.to_path_buf();
    }
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(policy.name());
    PathBuf::from(name)
}

/// Writes each record as one line of JSON.
///
/// The first write failure is kept (and later records are dropped) until [JsonLines::finish].
pub struct JsonLines<W: Write> {
    writer: W,
    failure: Option<io::Error>,
}

impl<W: Write> JsonLines<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failure: None,
        }
    }

    /// Flush and return the writer, or the first error encountered.
    pub fn finish(mut self) -> Result<W, io::Error> {
        if let Some(err) = self.failure {
            return Err(err);
        }
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> Sink for JsonLines<W> {
    fn record(&mut self, record: Record) {
        if self.failure.is_some() {
            return;
        }
        let result = serde_json::to_writer(&mut self.writer, &record)
            .map_err(io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"));
        if let Err(err) = result {
            self.failure = Some(err);
        }
    }
}

/// Column titles matching [row].
pub fn header() -> String {
    format!(
        "{:<18} {:>8} {:>8} {:>6} {:>9} {:>8} {:>7} {:>9} {:>12} {:>9} {:>7}  {}",
        "policy",
        "admitted",
        "rejected",
        "queued",
        "preempted",
        "released",
        "rounds",
        "exhausted",
        "tput (kb/s)",
        "delay(ms)",
        "loss%",
        "digest",
    )
}

/// One table row for `summary`.
pub fn row(summary: &Summary) -> String {
    let counts = &summary.counts;
    let digest = summary.digest.get(..16).unwrap_or(&summary.digest);
    format!(
        "{:<18} {:>8} {:>8} {:>6} {:>9} {:>8} {:>7} {:>9} {:>12.1} {:>9.2} {:>7.3}  {}",
        summary.policy.name(),
        counts.admitted,
        counts.rejected,
        counts.queued,
        counts.preempted,
        counts.released,
        counts.rounds,
        counts.exhausted_rounds,
        summary.throughput / 1_000.0,
        summary.delay,
        summary.loss * 100.0,
        digest,
    )
}
