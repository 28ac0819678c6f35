//! Loop pacing acceptance tests.
//!
//! The unprivileged tests run the classic demonstration (1000 iterations at
//! 1 kHz) under normal scheduling and check the pacing invariants with
//! bounds loose enough for a loaded CI host.
//!
//! # Acceptance Criteria (privileged)
//!
//! - Mean interval within 20µs of the period
//! - Every interval within 200µs of the period
//! - Zero missed deadlines

use super::common::{
    check_rt_prerequisites, run_paced_loop, unprivileged_config, JitterCriteria,
};
use pacer_common::config::{PacerConfig, WaitStrategy};
use pacer_common::time;
use pacer_runtime::realtime::lock_process_memory;
use pacer_runtime::spinner::Spinner;
use pacer_runtime::timer::Timer;
use std::time::Duration;

/// 1000 spins at 1 kHz take one second and yield 999 intervals.
#[test]
fn test_demo_scenario_1khz() {
    let config = unprivileged_config(1000.0, 1000);
    let run = run_paced_loop(&config).expect("paced loop failed");

    let stats = run.timer.statistics();
    assert_eq!(stats.count, 999);
    assert_eq!(run.timer.history().count(), 999);

    // Deadlines are absolute, so the loop can never finish early.
    assert!(
        run.elapsed >= Duration::from_millis(998),
        "loop finished early: {:?}",
        run.elapsed
    );
    assert!(
        run.elapsed < Duration::from_secs(5),
        "loop far too slow: {:?}",
        run.elapsed
    );

    let mean = stats.mean().expect("mean");
    assert!(mean >= Duration::from_micros(990), "mean {mean:?}");
    println!("{stats}");
    println!("missed deadlines: {}", run.missed_deadlines);
}

/// After a stall longer than a period the loop resumes its cadence without
/// a burst of back-to-back iterations.
#[test]
fn test_stall_resyncs_without_burst() {
    let period = Duration::from_millis(10);
    let mut spinner = Spinner::new();
    spinner.set_period(period).unwrap();
    let mut timer = Timer::new();

    spinner.spin().unwrap();
    spinner.spin().unwrap();

    time::sleep(Duration::from_millis(55));

    // Late by more than a period: returns at once and resyncs.
    spinner.spin().unwrap();
    assert_eq!(spinner.missed_deadlines(), 1);

    timer.tac_tic();
    for _ in 0..3 {
        spinner.spin().unwrap();
        timer.tac_tic();
    }

    for interval in timer.history() {
        assert!(
            interval >= period - Duration::from_millis(1),
            "burst iteration after stall: {interval:?}"
        );
    }
}

/// Every wait strategy holds the period on average.
#[test]
fn test_wait_strategies_hold_period() {
    for strategy in [WaitStrategy::Sleep, WaitStrategy::Hybrid, WaitStrategy::Busy] {
        let mut config = unprivileged_config(200.0, 40);
        config.spinner.strategy = strategy;

        let run = run_paced_loop(&config).expect("paced loop failed");
        let stats = run.timer.statistics();
        assert_eq!(stats.count, 39);

        let mean = stats.mean().expect("mean");
        assert!(
            mean >= Duration::from_micros(4_900) && mean < Duration::from_millis(10),
            "{strategy}: mean {mean:?}"
        );
    }
}

/// The measurement dump has one `"<index> <seconds>"` line per interval.
#[test]
fn test_dump_measurements_after_run() {
    let mut config = unprivileged_config(500.0, 25);
    config.timer.name = "dump".into();
    let run = run_paced_loop(&config).expect("paced loop failed");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("measurements.dat");
    run.timer.dump_measurements(&path).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 24);

    for (expected_index, line) in lines.iter().enumerate() {
        let (index, seconds) = line.split_once(' ').expect("two columns");
        assert_eq!(index.parse::<usize>().unwrap(), expected_index);
        let seconds: f64 = seconds.parse().unwrap();
        assert!(seconds > 0.0 && seconds < 1.0, "line {line:?}");
    }
}

/// The default configuration on an RT-capable host meets jitter criteria.
#[test]
#[ignore = "Requires root and a quiet machine"]
fn test_realtime_jitter_1khz() {
    if let Err(e) = check_rt_prerequisites() {
        eprintln!("Skipping test: {}", e);
        return;
    }

    let config = PacerConfig::default();
    let memory = lock_process_memory();
    println!("Memory locked: {}", memory.is_locked());

    let run = run_paced_loop(&config).expect("paced loop failed");
    assert!(run.status.is_realtime(), "RT scheduling not applied: {:?}", run.status);

    let stats = run.timer.statistics();
    println!("{stats}");
    println!("p99: {:?}", run.timer.percentile(99.0));

    let criteria = JitterCriteria::realtime(Duration::from_millis(1));
    assert!(
        criteria.check(&stats, run.missed_deadlines),
        "Jitter test failed: min={:?}, max={:?}, missed={}",
        stats.min(),
        stats.max(),
        run.missed_deadlines
    );
}
