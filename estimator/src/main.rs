//! Compare scheduling policies on a simulated cell.

use clap::{value_parser, Arg, ArgMatches, Command};
use colored::Colorize;
use estimator::{crate_version, evaluate, header, load, policies, row, trace_path, Error, JsonLines};
use qosim_radio::trace::Discard;
use std::{
    fs::File,
    io::BufWriter,
    path::PathBuf,
    process::ExitCode,
};
use tracing::{info, Level};

fn main() -> ExitCode {
    let matches = Command::new("qosim-estimator")
        .about("Compare scheduling, admission, and preemption policies on a simulated cell")
        .version(crate_version())
        .arg(
            Arg::new("scenario")
                .long("scenario")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to the YAML scenario"),
        )
        .arg(
            Arg::new("policy")
                .long("policy")
                .default_value("all")
                .value_parser(value_parser!(String))
                .help(
                    "Priority policy to evaluate:\n\
                       round-robin | proportional-fair | strict-priority | deadline-aware | all",
                ),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_parser(value_parser!(u64))
                .help("Override the scenario seed"),
        )
        .arg(
            Arg::new("trace")
                .long("trace")
                .value_parser(value_parser!(PathBuf))
                .help(
                    "Write observation records as JSON lines to this file\n\
                     (suffixed with the policy name when several policies run)",
                ),
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .num_args(0)
                .help("Print the metrics registry after each run"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .value_parser(value_parser!(Level))
                .help("Maximum log level (error, warn, info, debug, trace)"),
        )
        .get_matches();

    // Initialize logging
    let level = matches
        .get_one::<Level>("log-level")
        .copied()
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match execute(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", format!("error: {err}").red());
            ExitCode::FAILURE
        }
    }
}

fn execute(matches: &ArgMatches) -> Result<(), Error> {
    let scenario = matches
        .get_one::<PathBuf>("scenario")
        .expect("scenario is required");
    let selector = matches
        .get_one::<String>("policy")
        .map(String::as_str)
        .unwrap_or("all");
    let seed = matches.get_one::<u64>("seed").copied();
    let trace = matches.get_one::<PathBuf>("trace");
    let show_metrics = matches.get_flag("metrics");

    let config = load(scenario)?;
    let policies = policies(selector)?;
    info!(scenario = %scenario.display(), runs = policies.len(), "loaded scenario");

    println!("{}", header().bold().blue());
    for &policy in &policies {
        let (summary, metrics) = match trace {
            Some(base) => {
                let path = trace_path(base, policy, policies.len());
                let sink = JsonLines::new(BufWriter::new(File::create(&path)?));
                let outcome = evaluate(&config, policy, seed, sink)?;
                outcome.sink.finish()?;
                info!(policy = %policy, path = %path.display(), "wrote trace");
                (outcome.summary, outcome.metrics)
            }
            None => {
                let outcome = evaluate(&config, policy, seed, Discard)?;
                (outcome.summary, outcome.metrics)
            }
        };
        println!("{}", row(&summary).green());
        if show_metrics {
            println!("{}", metrics.trim_end().white());
            println!("{}", "-".repeat(80).yellow());
        }
    }
    Ok(())
}
