use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use chipcheck_config::{
    ChipDescriptor, StopReason, TestAssertion, TestLimits, TestScript, Verdict,
};
use chipcheck_core::machine::{Limits, Machine, RunReport};
use chipcheck_core::metrics::RunMetrics;
use chipcheck_core::snapshot::{CorruptionSnapshot, RunSnapshot};

const EXIT_PASS: u8 = 0;
const EXIT_ASSERT_FAIL: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

const RESULT_SCHEMA_VERSION: &str = "1.0";

/// Long enough for a genuine part to blink a few times.
const DEFAULT_SIM_TIME_MS: u64 = 3000;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "STM32F103 genuineness self-test, on a simulated part",
    long_about = None
)]
struct Cli {
    /// Log register traffic and every heartbeat
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Power up one simulated chip and watch it.
    Run(RunArgs),

    /// Deterministic, CI-friendly runner mode driven by a test script (YAML).
    Test(TestArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to the chip descriptor (YAML)
    #[arg(short, long)]
    chip: PathBuf,

    /// Stop after this many fill/verify passes
    #[arg(long)]
    max_passes: Option<u64>,

    /// Stop after this much device time (default: 3000 if no other limit)
    #[arg(long)]
    sim_time_ms: Option<u64>,

    /// Stop after this much host time
    #[arg(long)]
    wall_time_ms: Option<u64>,

    /// Device time per host time; unset runs as fast as possible
    #[arg(long)]
    speed: Option<f64>,

    /// Write a run snapshot (JSON)
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Do not echo the serial stream to stdout
    #[arg(long)]
    no_uart_stdout: bool,
}

#[derive(Parser, Debug)]
struct TestArgs {
    /// Path to the test script (YAML)
    #[arg(short = 'c', long)]
    script: PathBuf,

    /// Override the chip descriptor named by the script
    #[arg(long)]
    chip: Option<PathBuf>,

    /// Disable UART stdout echo (still captured for assertions/artifacts)
    #[arg(long)]
    no_uart_stdout: bool,

    /// Directory to write test artifacts (result.json, uart.log)
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TestResult {
    result_schema_version: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_reason: Option<StopReason>,
    limits: Option<TestLimits>,
    passes: u64,
    cells_verified: u64,
    heartbeats: u64,
    uart_dropped: u64,
    sim_time_ms: u64,
    wall_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    corruption: Option<CorruptionSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    assertions: Vec<AssertionResult>,
    chip_hash: String,
    config: TestConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct AssertionResult {
    assertion: TestAssertion,
    passed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct TestConfig {
    chip: Option<PathBuf>,
    script: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing with appropriate level based on --trace flag
    if cli.trace {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Run(args) => run_chip(args),
        Commands::Test(args) => run_test(args),
    }
}

fn run_chip(args: RunArgs) -> ExitCode {
    info!("Loading chip descriptor: {:?}", args.chip);
    let machine = ChipDescriptor::from_file(&args.chip).and_then(|c| Machine::from_config(&c));
    let mut machine = match machine {
        Ok(m) => m,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    machine.echo_uart(!args.no_uart_stdout);

    let mut limits = Limits {
        max_passes: args.max_passes,
        sim_time: args.sim_time_ms.map(Duration::from_millis),
        wall_time: args.wall_time_ms.map(Duration::from_millis),
        speed: args.speed,
    };
    if limits.max_passes.is_none() && limits.wall_time.is_none() && limits.sim_time.is_none() {
        limits.sim_time = Some(Duration::from_millis(DEFAULT_SIM_TIME_MS));
    }
    if let Err(e) = limits.validate() {
        error!("{}", e);
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    let metrics = Arc::new(RunMetrics::new());
    machine.observers.push(metrics.clone());

    let report = match machine.run(&limits) {
        Ok(r) => r,
        Err(e) => {
            error!("Simulation failed: {}", e);
            return ExitCode::from(EXIT_RUNTIME_ERROR);
        }
    };
    if !args.no_uart_stdout && !report.uart.is_empty() {
        println!();
    }

    info!(
        "Verdict: {:?} ({} passes, {} heartbeats, {:.0} cells/s)",
        report.verdict,
        report.passes,
        report.heartbeats,
        metrics.get_cells_per_sec()
    );
    if let Some(c) = report.corruption {
        info!(
            "First bad cell: {} at {:#010x} (expected {:#010x}, read {:#010x})",
            c.cell, c.address, c.expected, c.actual
        );
    }

    if let Some(path) = &args.snapshot {
        if let Err(e) = RunSnapshot::from(&report).write_to(path) {
            error!("{:#}", e);
            return ExitCode::from(EXIT_RUNTIME_ERROR);
        }
        info!("Snapshot written to {:?}", path);
    }

    ExitCode::from(EXIT_PASS)
}

fn resolve_chip_path(args: &TestArgs, script: &TestScript) -> PathBuf {
    if let Some(chip) = &args.chip {
        return chip.clone();
    }
    let chip = Path::new(&script.inputs.chip);
    if chip.is_absolute() {
        chip.to_path_buf()
    } else {
        args.script
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(chip)
    }
}

fn run_test(args: TestArgs) -> ExitCode {
    let script = match TestScript::from_file(&args.script) {
        Ok(s) => s,
        Err(e) => {
            let msg = format!("{:#}", e);
            error!("{}", msg);
            write_error_outputs(&args, None, None, msg);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let chip_path = resolve_chip_path(&args, &script);
    info!("Loading chip descriptor: {:?}", chip_path);
    let chip_bytes = match std::fs::read(&chip_path) {
        Ok(b) => b,
        Err(e) => {
            let msg = format!("Failed to read chip descriptor {:?}: {}", chip_path, e);
            error!("{}", msg);
            write_error_outputs(&args, Some(&chip_path), Some(&script.limits), msg);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let machine = ChipDescriptor::from_file(&chip_path).and_then(|c| Machine::from_config(&c));
    let mut machine = match machine {
        Ok(m) => m,
        Err(e) => {
            let msg = format!("{:#}", e);
            error!("{}", msg);
            write_error_outputs(&args, Some(&chip_path), Some(&script.limits), msg);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    machine.echo_uart(!args.no_uart_stdout);

    let metrics = Arc::new(RunMetrics::new());
    machine.observers.push(metrics.clone());

    let report = match machine.run(&Limits::from(&script.limits)) {
        Ok(r) => r,
        Err(e) => {
            let msg = format!("Simulation failed: {}", e);
            error!("{}", msg);
            write_error_outputs(&args, Some(&chip_path), Some(&script.limits), msg);
            return ExitCode::from(EXIT_RUNTIME_ERROR);
        }
    };
    if !args.no_uart_stdout && !report.uart.is_empty() {
        println!();
    }

    let uart_text = String::from_utf8_lossy(&report.uart).to_string();
    let mut assertion_results = Vec::new();
    let mut all_passed = true;
    let mut expected_stop_reason_matched = false;

    for assertion in &script.assertions {
        let passed = evaluate(assertion, &report, &uart_text);

        if matches!(assertion, TestAssertion::ExpectedStopReason(_)) && passed {
            expected_stop_reason_matched = true;
        }

        if !passed {
            all_passed = false;
            error!(
                "Assertion failed: {:?} (verdict {:?}, stop {:?}, {} heartbeats)",
                assertion, report.verdict, report.stop_reason, report.heartbeats
            );
        }

        assertion_results.push(AssertionResult {
            assertion: assertion.clone(),
            passed,
        });
    }

    // Running out of host time says nothing about the chip unless the
    // script expected it.
    let stop_requires_assertion = report.stop_reason == StopReason::WallTime;
    let failed = !all_passed || (stop_requires_assertion && !expected_stop_reason_matched);
    let status = if failed { "fail" } else { "pass" };

    let result = TestResult {
        result_schema_version: RESULT_SCHEMA_VERSION.to_string(),
        status: status.to_string(),
        verdict: Some(report.verdict),
        stop_reason: Some(report.stop_reason),
        limits: Some(script.limits.clone()),
        passes: report.passes,
        cells_verified: metrics.get_cells_verified(),
        heartbeats: report.heartbeats,
        uart_dropped: report.uart_dropped,
        sim_time_ms: report.sim_time.as_millis() as u64,
        wall_time_ms: report.wall_time.as_millis() as u64,
        corruption: RunSnapshot::from(&report).corruption,
        message: None,
        assertions: assertion_results,
        chip_hash: hash_bytes(&chip_bytes),
        config: TestConfig {
            chip: Some(chip_path.clone()),
            script: args.script.clone(),
        },
    };
    write_outputs(&args, &result, Some(&report));

    info!("Test {}: {:?}", status, report.verdict);
    if failed {
        ExitCode::from(EXIT_ASSERT_FAIL)
    } else {
        ExitCode::from(EXIT_PASS)
    }
}

fn evaluate(assertion: &TestAssertion, report: &RunReport, uart_text: &str) -> bool {
    match assertion {
        TestAssertion::ExpectedVerdict(a) => a.expected_verdict == report.verdict,
        TestAssertion::UartContains(a) => uart_text.contains(&a.uart_contains),
        TestAssertion::MinHeartbeats(a) => report.heartbeats >= a.min_heartbeats,
        TestAssertion::ExpectedStopReason(a) => a.expected_stop_reason == report.stop_reason,
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn write_error_outputs(
    args: &TestArgs,
    chip_path: Option<&PathBuf>,
    limits: Option<&TestLimits>,
    message: String,
) {
    let chip_hash = chip_path
        .and_then(|p| std::fs::read(p).ok())
        .map(|b| hash_bytes(&b))
        .unwrap_or_default();

    let result = TestResult {
        result_schema_version: RESULT_SCHEMA_VERSION.to_string(),
        status: "error".to_string(),
        verdict: None,
        stop_reason: None,
        limits: limits.cloned(),
        passes: 0,
        cells_verified: 0,
        heartbeats: 0,
        uart_dropped: 0,
        sim_time_ms: 0,
        wall_time_ms: 0,
        corruption: None,
        message: Some(message),
        assertions: Vec::new(),
        chip_hash,
        config: TestConfig {
            chip: chip_path.cloned(),
            script: args.script.clone(),
        },
    };
    write_outputs(args, &result, None);
}

fn write_outputs(args: &TestArgs, result: &TestResult, report: Option<&RunReport>) {
    let Some(output_dir) = &args.output_dir else {
        return;
    };
    if let Err(e) = std::fs::create_dir_all(output_dir) {
        error!("Failed to create output directory {:?}: {}", output_dir, e);
        return;
    }

    let result_path = output_dir.join("result.json");
    match std::fs::File::create(&result_path) {
        Ok(f) => {
            if let Err(e) = serde_json::to_writer_pretty(f, result) {
                error!("Failed to write result.json: {}", e);
            }
        }
        Err(e) => error!("Failed to create result.json: {}", e),
    }

    let uart = report.map(|r| r.uart.as_slice()).unwrap_or_default();
    if let Err(e) = std::fs::write(output_dir.join("uart.log"), uart) {
        error!("Failed to write uart.log: {}", e);
    }

    if let Some(report) = report {
        if let Err(e) = RunSnapshot::from(report).write_to(output_dir.join("snapshot.json")) {
            error!("{:#}", e);
        }
    }
}
