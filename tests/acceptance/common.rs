//! Common utilities for integration tests.
//!
//! Provides helpers for:
//! - Checking real-time prerequisites (PREEMPT_RT, privileges)
//! - Running a paced loop on a worker thread
//! - Judging timing statistics against acceptance criteria

use pacer_common::config::{PacerConfig, SchedPolicy};
use pacer_common::error::PacerResult;
use pacer_runtime::realtime::RealtimeStatus;
use pacer_runtime::spinner::Spinner;
use pacer_runtime::thread::RealtimeThread;
use pacer_runtime::timer::{Timer, TimerStatistics};
use std::fs;
use std::time::Duration;

/// Result of one paced run.
#[derive(Debug)]
pub struct PacedRun {
    /// Settings the worker actually received.
    pub status: RealtimeStatus,
    /// Timer holding every iteration.
    pub timer: Timer,
    /// Deadlines the spinner had to resync.
    pub missed_deadlines: u64,
    /// Wall time from the first spin to the last.
    pub elapsed: Duration,
}

/// Check if the system has PREEMPT_RT kernel.
pub fn has_preempt_rt() -> bool {
    if let Ok(version) = fs::read_to_string("/proc/version") {
        version.contains("PREEMPT_RT") || version.contains("PREEMPT RT")
    } else {
        false
    }
}

/// Check if running as root (required for RT priority).
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Check all prerequisites for real-time tests.
pub fn check_rt_prerequisites() -> Result<(), String> {
    if !has_preempt_rt() {
        eprintln!("WARNING: PREEMPT_RT kernel not detected - jitter results may be unreliable");
    }

    if is_root() {
        Ok(())
    } else {
        Err("Not running as root - RT priority tests will fail".to_string())
    }
}

/// Configuration that runs anywhere: normal scheduling, no memory lock.
pub fn unprivileged_config(frequency_hz: f64, iterations: u64) -> PacerConfig {
    let mut config = PacerConfig::default();
    config.lock_memory = false;
    config.iterations = iterations;
    config.spinner.frequency_hz = frequency_hz;
    config.realtime.policy = SchedPolicy::Other;
    config
}

/// Spawn a worker from `config` that spins `config.iterations` times and
/// marks the timer after each spin.
pub fn run_paced_loop(config: &PacerConfig) -> PacerResult<PacedRun> {
    let spinner_config = config.spinner.clone();
    let timer_config = config.timer.clone();
    let iterations = config.iterations;

    let mut worker = RealtimeThread::new(config.realtime.clone());
    let status = worker.spawn(move || -> PacerResult<(Timer, u64, Duration)> {
        let mut spinner = Spinner::from_config(&spinner_config)?;
        let mut timer = Timer::from_config(&timer_config);
        let mut first = None;
        for _ in 0..iterations {
            spinner.spin()?;
            first.get_or_insert_with(pacer_common::time::now);
            timer.tac_tic();
        }
        let elapsed = first.map_or(Duration::ZERO, |start| pacer_common::time::now() - start);
        Ok((timer, spinner.missed_deadlines(), elapsed))
    })?;

    let (timer, missed_deadlines, elapsed) = worker.join()??;
    Ok(PacedRun {
        status,
        timer,
        missed_deadlines,
        elapsed,
    })
}

/// Acceptance criteria for paced loops.
pub struct JitterCriteria {
    /// Target period of the loop.
    pub period: Duration,
    /// Maximum deviation of the mean interval from the period.
    pub max_mean_error: Duration,
    /// Maximum deviation of any single interval from the period.
    pub max_interval_error: Duration,
    /// Maximum acceptable missed deadlines.
    pub max_missed: u64,
}

impl JitterCriteria {
    /// Criteria for an RT thread on an otherwise idle machine.
    pub fn realtime(period: Duration) -> Self {
        Self {
            period,
            max_mean_error: Duration::from_micros(20),
            max_interval_error: Duration::from_micros(200),
            max_missed: 0,
        }
    }

    /// Check if a run meets the criteria.
    pub fn check(&self, stats: &TimerStatistics, missed: u64) -> bool {
        let (Some(min), Some(max), Some(mean)) = (stats.min(), stats.max(), stats.mean()) else {
            return false;
        };
        deviation(mean, self.period) <= self.max_mean_error
            && deviation(min, self.period) <= self.max_interval_error
            && deviation(max, self.period) <= self.max_interval_error
            && missed <= self.max_missed
    }
}

fn deviation(a: Duration, b: Duration) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(min_us: u64, max_us: u64, mean_us: f64) -> TimerStatistics {
        TimerStatistics {
            name: "criteria".into(),
            count: 100,
            min_ns: Some(min_us * 1000),
            max_ns: Some(max_us * 1000),
            mean_ns: Some(mean_us * 1000.0),
            std_dev_ns: Some(0.0),
        }
    }

    #[test]
    fn test_criteria_pass() {
        let criteria = JitterCriteria::realtime(Duration::from_millis(1));
        assert!(criteria.check(&stats(990, 1010, 1000.0), 0));
    }

    #[test]
    fn test_criteria_fail_on_outlier() {
        let criteria = JitterCriteria::realtime(Duration::from_millis(1));
        assert!(!criteria.check(&stats(990, 1500, 1000.0), 0));
    }

    #[test]
    fn test_criteria_fail_on_missed() {
        let criteria = JitterCriteria::realtime(Duration::from_millis(1));
        assert!(!criteria.check(&stats(990, 1010, 1000.0), 1));
    }

    #[test]
    fn test_criteria_fail_without_data() {
        let criteria = JitterCriteria::realtime(Duration::from_millis(1));
        let empty = Timer::new().statistics();
        assert!(!criteria.check(&empty, 0));
    }
}
