//! rt-pacer demo entry point.
//!
//! Locks memory, spawns a real-time worker that paces itself with a
//! [`Spinner`] and measures each iteration with a [`Timer`], then reports
//! the timing statistics.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pacer_common::config::{CpuAffinity, PacerConfig, SchedPolicy, WaitStrategy};
use pacer_common::error::PacerResult;
use pacer_common::time;
use pacer_runtime::realtime::{lock_process_memory, MemoryLockStatus};
use pacer_runtime::spinner::Spinner;
use pacer_runtime::thread::RealtimeThread;
use pacer_runtime::timer::{Timer, TimerStatistics};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

/// Report format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text.
    Text,
    /// A single JSON object.
    Json,
}

/// Demo command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "pacer-demo",
    about = "Paces a real-time thread at a fixed frequency and reports timing statistics",
    version,
    long_about = None
)]
struct Args {
    /// Path to a pacer configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Loop frequency in hertz.
    #[arg(long, short = 'f')]
    frequency: Option<f64>,

    /// Number of paced iterations.
    #[arg(long, short = 'n')]
    iterations: Option<u64>,

    /// Scheduler priority (1-99).
    #[arg(long, short = 'p')]
    priority: Option<u8>,

    /// Scheduler policy (fifo, rr, other).
    #[arg(long)]
    policy: Option<SchedPolicy>,

    /// CPUs to pin the worker to, comma separated.
    #[arg(long, value_delimiter = ',')]
    cpu: Vec<usize>,

    /// Wait strategy (sleep, hybrid, busy).
    #[arg(long)]
    strategy: Option<WaitStrategy>,

    /// Skip locking process memory.
    #[arg(long)]
    no_lock_memory: bool,

    /// Report format.
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Write the retained per-iteration durations to FILE.
    #[arg(long, value_name = "FILE")]
    dump: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

/// Outcome of one demo run.
#[derive(Debug, Serialize)]
struct RunReport {
    frequency_hz: f64,
    iterations: u64,
    memory_locked: bool,
    realtime: bool,
    policy: Option<String>,
    priority: Option<u8>,
    cpu_affinity: Option<Vec<usize>>,
    missed_deadlines: u64,
    statistics: TimerStatistics,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting pacer demo");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);

    info!(
        frequency_hz = config.spinner.frequency_hz,
        iterations = config.iterations,
        policy = %config.realtime.policy,
        priority = config.realtime.priority,
        strategy = %config.spinner.strategy,
        "Configuration loaded"
    );

    let (report, timer) = run(&config)?;

    if let Some(path) = &args.dump {
        timer
            .dump_measurements(path)
            .with_context(|| format!("Failed to dump measurements to {}", path.display()))?;
        info!(path = %path.display(), "Measurements written");
    }

    match args.format {
        OutputFormat::Text => print_text(&report),
        OutputFormat::Json => {
            let json =
                serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
            println!("{json}");
        }
    }

    Ok(())
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("pacer_demo={level},pacer_runtime={level},pacer_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `PACER_CONFIG_PATH` environment variable
/// 3. `config/pacer.toml` (local development)
/// 4. Built-in defaults
fn load_config(args: &Args) -> Result<PacerConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return PacerConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("PACER_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from PACER_CONFIG_PATH");
            return PacerConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from PACER_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "PACER_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    let local_path = PathBuf::from("config/pacer.toml");
    if local_path.exists() {
        info!(?local_path, "Loading config from local path");
        return PacerConfig::from_file(&local_path)
            .with_context(|| format!("Failed to load config from {local_path:?}"));
    }

    info!("No config file found, using built-in defaults");
    Ok(PacerConfig::default())
}

/// Override file values with command-line arguments.
fn apply_overrides(config: &mut PacerConfig, args: &Args) {
    if let Some(frequency) = args.frequency {
        config.spinner.frequency_hz = frequency;
    }
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if let Some(priority) = args.priority {
        config.realtime.priority = priority;
    }
    if let Some(policy) = args.policy {
        config.realtime.policy = policy;
    }
    if !args.cpu.is_empty() {
        config.realtime.cpu_affinity = CpuAffinity::from(args.cpu.clone());
    }
    if let Some(strategy) = args.strategy {
        config.spinner.strategy = strategy;
    }
    if args.no_lock_memory {
        config.lock_memory = false;
    }
}

/// Lock memory, run the paced loop on a real-time thread and collect the
/// results.
fn run(config: &PacerConfig) -> Result<(RunReport, Timer)> {
    let memory = if config.lock_memory {
        lock_process_memory()
    } else {
        MemoryLockStatus::Degraded {
            reason: "disabled by configuration".into(),
        }
    };

    let spinner_config = config.spinner.clone();
    let timer_config = config.timer.clone();
    let iterations = config.iterations;

    let mut worker = RealtimeThread::new(config.realtime.clone());
    let status = worker
        .spawn(move || -> PacerResult<(Timer, u64)> {
            let mut spinner = Spinner::from_config(&spinner_config)?;
            let mut timer = Timer::from_config(&timer_config);
            for _ in 0..iterations {
                spinner.spin()?;
                timer.tac_tic();
            }
            Ok((timer, spinner.missed_deadlines()))
        })
        .context("Failed to spawn real-time thread")?;

    if !status.is_realtime() {
        warn!("Worker runs without real-time scheduling, timings will be noisy");
    }

    let started = time::now();
    let (timer, missed_deadlines) = worker
        .join()
        .context("Real-time thread failed")?
        .context("Paced loop failed")?;
    info!(elapsed = ?(time::now() - started), "Paced loop finished");

    timer.log_statistics();

    let report = RunReport {
        frequency_hz: config.spinner.frequency_hz,
        iterations,
        memory_locked: memory.is_locked(),
        realtime: status.is_realtime(),
        policy: status.scheduler_policy.map(|p| p.to_string()),
        priority: status.scheduler_priority,
        cpu_affinity: status.cpu_affinity,
        missed_deadlines,
        statistics: timer.statistics(),
    };
    Ok((report, timer))
}

fn print_text(report: &RunReport) {
    println!(
        "{} iterations at {} Hz ({}, memory {})",
        report.iterations,
        report.frequency_hz,
        match (&report.policy, report.priority) {
            (Some(policy), Some(priority)) if report.realtime => format!("{policy} priority {priority}"),
            _ => String::from("normal scheduling"),
        },
        if report.memory_locked { "locked" } else { "unlocked" },
    );
    if report.missed_deadlines > 0 {
        println!("missed deadlines: {}", report.missed_deadlines);
    }
    println!("{}", report.statistics);
}
