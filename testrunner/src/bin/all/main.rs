use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use std::{env, fs};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use log::*;

use ncr_testrunner::{TestFailure, TestReport, TestReportTest, TestResult};

#[derive(Parser)]
struct Args {
    scenario_dir: String,
    output_dir: String,

    /// Driver options applied to every scenario
    #[arg(long)]
    options: Option<String>,

    #[arg(short('j'), default_value_t = num_cpus::get())]
    parallel: usize,
}

fn get_binary_path(binary_name: &str) -> Result<PathBuf> {
    // First try using Cargo environment variable
    if let Ok(path) = env::var(format!("CARGO_BIN_EXE_{}", binary_name)) {
        return Ok(PathBuf::from(path));
    }

    // Otherwise find it relative to the current executable
    let current_exe = env::current_exe().context("Failed to get current executable path")?;
    let bin_dir = current_exe
        .parent()
        .context("Failed to get binary directory")?;
    Ok(bin_dir.join(binary_name))
}

fn test_name(scenario: &Path) -> String {
    scenario
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn run_one(single: &Path, scenario: &Path, output_dir: &str, options: Option<&str>) -> Result<TestResult> {
    let name = test_name(scenario);
    let mut cmd = Command::new(single);
    cmd.env("RUST_LOG_STYLE", "never")
        .arg(scenario)
        .arg("--report")
        .arg(format!("{}/{}.json", output_dir, name));
    if let Some(o) = options {
        cmd.arg("--options").arg(o);
    }
    let output = cmd
        .output()
        .with_context(|| format!("Failed to execute {}", single.display()))?;
    fs::write(format!("{}/{}.log", output_dir, name), output.stderr)?;

    Ok(if output.status.success() {
        TestResult::Pass
    } else {
        TestResult::Failed(
            output
                .status
                .code()
                .map_or(TestFailure::Signal, TestFailure::ExitCode),
        )
    })
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();
    let args = Args::parse();

    // Collect tests
    let mut tests = fs::read_dir(&args.scenario_dir)?
        .map(|res| res.map(|e| e.path()))
        .collect::<Result<Vec<_>, std::io::Error>>()?;
    tests.retain(|p| p.extension().is_some_and(|e| e == "json"));
    tests.sort();
    if tests.is_empty() {
        bail!("No scenarios in {}", args.scenario_dir);
    }
    fs::create_dir_all(&args.output_dir)?;

    let single_bin = get_binary_path("single")?;
    if !single_bin.exists() {
        bail!("{} not found", single_bin.display());
    }

    let report = Arc::new(Mutex::new(TestReport::default()));

    info!(
        "Collected {} scenarios, running {} in parallel",
        tests.len(),
        args.parallel
    );
    let pool = rusty_pool::ThreadPool::new(args.parallel, args.parallel, Duration::from_secs(60));
    let start_time = Instant::now();

    for scenario in tests {
        let t_report = Arc::clone(&report);
        let t_single_bin = single_bin.clone();
        let t_output_dir = args.output_dir.clone();
        let t_options = args.options.clone();

        pool.execute(move || {
            let name = test_name(&scenario);
            info!("Running {}...", name);
            let result = match run_one(
                &t_single_bin,
                &scenario,
                &t_output_dir,
                t_options.as_deref(),
            ) {
                Ok(r) => r,
                Err(e) => {
                    error!("{}: {:?}", name, e);
                    TestResult::Failed(TestFailure::ExitCode(-1))
                }
            };
            match &result {
                TestResult::Pass => info!("{}: pass", name),
                TestResult::Failed(f) => warn!("{}: failed ({:?})", name, f),
            }
            if let Ok(mut r) = t_report.lock() {
                r.tests.push(TestReportTest {
                    name,
                    scenario: scenario.to_string_lossy().to_string(),
                    result,
                });
            }
        });
    }
    pool.shutdown_join();

    let report = report.lock().map_err(|_| anyhow!("Report lock poisoned"))?;
    fs::write(
        format!("{}/report.json", args.output_dir),
        serde_json::to_string(&*report)?,
    )?;
    let failed = report
        .tests
        .iter()
        .filter(|t| matches!(t.result, TestResult::Failed(_)))
        .count();
    info!(
        "{} scenarios completed in {:?}, {} failed",
        report.tests.len(),
        Instant::now() - start_time,
        failed
    );

    Ok(())
}
