use std::fs;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use itertools::Itertools;
use log::*;

use ncr_testrunner::{Scenario, run_scenario};

#[derive(Parser)]
struct Args {
    /// Scenario file (JSON)
    scenario: String,

    /// Driver options, overriding the scenario's
    #[arg(long)]
    options: Option<String>,

    /// Write the full report here
    #[arg(long)]
    report: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .init();
    let args = Args::parse();

    let scenario: Scenario = serde_json::from_str(
        &fs::read_to_string(&args.scenario)
            .with_context(|| format!("Cannot read {}", args.scenario))?,
    )
    .with_context(|| format!("Cannot parse {}", args.scenario))?;

    let start_time = Instant::now();
    let report = run_scenario(&scenario, args.options.as_deref())?;
    info!(
        "{} ({}): {} commands in {} clocks, {:?} wall time",
        report.adapter,
        report.chip,
        report.commands.len(),
        report.ticks,
        Instant::now() - start_time
    );
    info!(
        "Outcomes: {}",
        report
            .commands
            .iter()
            .map(|c| c.result.host)
            .counts()
            .into_iter()
            .map(|(host, n)| format!("{} x{}", host, n))
            .sorted()
            .join(", ")
    );
    for inq in &report.inquiry {
        info!(
            "Target {}: {} {} {} (type {})",
            inq.target, inq.vendor, inq.product, inq.revision, inq.peripheral_type
        );
    }

    if let Some(path) = &args.report {
        fs::write(path, serde_json::to_string_pretty(&report)?)?;
    }

    if !report.passed() {
        for f in &report.failures {
            error!("{}", f);
        }
        std::process::exit(2);
    }
    Ok(())
}
