//! Per-iteration duration measurement.
//!
//! A [`Timer`] records the time between successive marks into a ring buffer
//! without allocating on the measurement path. Summary statistics are kept
//! as running accumulators, so they cover every recorded interval even after
//! the ring buffer has wrapped.

use pacer_common::config::TimerConfig;
use pacer_common::error::{PacerError, PacerResult};
use pacer_common::time::{Clock, ClockReading, MonotonicClock};
use serde::Serialize;
use std::fmt;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Measures intervals between marks and summarizes them.
#[derive(Debug)]
pub struct Timer<C: Clock = MonotonicClock> {
    clock: C,
    /// Label used in reports.
    name: String,
    /// Ring buffer of interval durations in nanoseconds.
    samples: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of samples retained (saturates at buffer size).
    sample_count: usize,
    /// Intervals recorded since construction or reset.
    count: u64,
    min_ns: u64,
    max_ns: u64,
    /// Running mean and sum of squared deviations (Welford).
    mean_ns: f64,
    m2: f64,
    /// Start of the interval currently being measured.
    last_mark: Option<ClockReading>,
}

impl Timer {
    /// Create a timer on the monotonic clock with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&TimerConfig::default())
    }

    /// Create a timer from configuration.
    #[must_use]
    pub fn from_config(config: &TimerConfig) -> Self {
        Self::with_clock(MonotonicClock, &config.name, config.history_size)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Timer<C> {
    /// Create a timer reading time from `clock`, retaining the last
    /// `history_size` intervals (at least one).
    pub fn with_clock(clock: C, name: &str, history_size: usize) -> Self {
        Self {
            clock,
            name: name.to_owned(),
            samples: vec![0u64; history_size.max(1)].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            count: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            mean_ns: 0.0,
            m2: 0.0,
            last_mark: None,
        }
    }

    /// Label used in reports.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Change the report label.
    pub fn set_name(&mut self, name: &str) {
        name.clone_into(&mut self.name);
    }

    /// Number of intervals the ring buffer retains.
    #[must_use]
    pub fn history_size(&self) -> usize {
        self.samples.len()
    }

    /// Resize the ring buffer. Clears all recorded data.
    pub fn set_history_size(&mut self, history_size: usize) {
        debug!(timer = %self.name, history_size, "Timer history resized");
        self.samples = vec![0u64; history_size.max(1)].into_boxed_slice();
        self.reset();
    }

    /// Start measuring an interval.
    #[inline]
    pub fn tic(&mut self) {
        self.last_mark = Some(self.clock.now());
    }

    /// Record the time since the last [`tic`](Self::tic) and return it.
    ///
    /// The mark is left in place, so repeated calls measure from the same
    /// starting point.
    ///
    /// # Errors
    ///
    /// Returns [`PacerError::Sequence`] if no mark has been set.
    #[inline]
    pub fn tac(&mut self) -> PacerResult<Duration> {
        let mark = self
            .last_mark
            .ok_or_else(|| PacerError::Sequence("tac() called before tic()".into()))?;
        let elapsed = self.clock.now() - mark;
        self.record(elapsed);
        Ok(elapsed)
    }

    /// Close the current interval and open the next one.
    ///
    /// Returns the closed interval, or `None` on the first call after
    /// construction or reset, which only sets the mark.
    #[inline]
    pub fn tac_tic(&mut self) -> Option<Duration> {
        let now = self.clock.now();
        let elapsed = self.last_mark.map(|mark| now - mark);
        if let Some(elapsed) = elapsed {
            self.record(elapsed);
        }
        self.last_mark = Some(now);
        elapsed
    }

    /// Record an externally measured interval.
    ///
    /// Allocation-free, for use in RT context.
    pub fn record(&mut self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);

        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = (self.sample_count + 1).min(self.samples.len());

        self.count += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);

        let x = ns as f64;
        let delta = x - self.mean_ns;
        self.mean_ns += delta / self.count as f64;
        self.m2 += delta * (x - self.mean_ns);
    }

    /// Intervals recorded since construction or reset.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Retained intervals, oldest first.
    pub fn history(&self) -> impl Iterator<Item = Duration> + '_ {
        let (older, newer) = if self.sample_count < self.samples.len() {
            (&self.samples[..self.sample_count], &self.samples[..0])
        } else {
            (&self.samples[self.write_pos..], &self.samples[..self.write_pos])
        };
        older.iter().chain(newer).map(|&ns| Duration::from_nanos(ns))
    }

    /// Compute a percentile over the retained intervals.
    ///
    /// Returns `None` if nothing is retained or `percentile` is outside
    /// 0.0..=100.0.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.sample_count == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        let idx = idx.min(sorted.len() - 1);

        Some(Duration::from_nanos(sorted[idx]))
    }

    /// Summarize every interval recorded since construction or reset.
    #[must_use]
    pub fn statistics(&self) -> TimerStatistics {
        let has_data = self.count > 0;
        TimerStatistics {
            name: self.name.clone(),
            count: self.count,
            min_ns: has_data.then_some(self.min_ns),
            max_ns: has_data.then_some(self.max_ns),
            mean_ns: has_data.then_some(self.mean_ns),
            std_dev_ns: has_data.then(|| (self.m2 / self.count as f64).sqrt()),
        }
    }

    /// Write a human-readable statistics report to `sink`.
    ///
    /// # Errors
    ///
    /// Returns any error from writing to `sink`.
    pub fn print_statistics<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        writeln!(sink, "{}", self.statistics())
    }

    /// Emit the statistics as a structured log event.
    pub fn log_statistics(&self) {
        let stats = self.statistics();
        info!(
            timer = %stats.name,
            count = stats.count,
            min_us = stats.min().map(|d| d.as_micros() as u64),
            max_us = stats.max().map(|d| d.as_micros() as u64),
            mean_us = stats.mean().map(|d| d.as_micros() as u64),
            std_dev_us = stats.std_dev().map(|d| d.as_micros() as u64),
            "Timer statistics"
        );
    }

    /// Write the retained intervals to a text file, oldest first, one
    /// `"<index> <seconds>"` line per interval.
    ///
    /// # Errors
    ///
    /// Returns [`PacerError::Io`] if the file cannot be written.
    pub fn dump_measurements(&self, path: &Path) -> PacerResult<()> {
        let file = std::fs::File::create(path)?;
        let mut out = BufWriter::new(file);
        for (index, duration) in self.history().enumerate() {
            writeln!(out, "{index} {:.9}", duration.as_secs_f64())?;
        }
        out.flush()?;
        debug!(timer = %self.name, path = %path.display(), samples = self.sample_count, "Measurements dumped");
        Ok(())
    }

    /// Clear all recorded data and the current mark.
    pub fn reset(&mut self) {
        self.samples.fill(0);
        self.write_pos = 0;
        self.sample_count = 0;
        self.count = 0;
        self.min_ns = u64::MAX;
        self.max_ns = 0;
        self.mean_ns = 0.0;
        self.m2 = 0.0;
        self.last_mark = None;
    }
}

/// Summary of a timer's recorded intervals.
///
/// All duration fields are `None` when nothing has been recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerStatistics {
    /// Timer label.
    pub name: String,
    /// Number of recorded intervals.
    pub count: u64,
    /// Shortest interval in nanoseconds.
    pub min_ns: Option<u64>,
    /// Longest interval in nanoseconds.
    pub max_ns: Option<u64>,
    /// Arithmetic mean in nanoseconds.
    pub mean_ns: Option<f64>,
    /// Population standard deviation in nanoseconds.
    pub std_dev_ns: Option<f64>,
}

impl TimerStatistics {
    /// Shortest interval.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        self.min_ns.map(Duration::from_nanos)
    }

    /// Longest interval.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        self.max_ns.map(Duration::from_nanos)
    }

    /// Mean interval, rounded to the nanosecond.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        self.mean_ns.map(nanos_to_duration)
    }

    /// Standard deviation, rounded to the nanosecond.
    #[must_use]
    pub fn std_dev(&self) -> Option<Duration> {
        self.std_dev_ns.map(nanos_to_duration)
    }

    /// Spread between longest and shortest interval in nanoseconds.
    #[must_use]
    pub fn jitter_ns(&self) -> Option<u64> {
        match (self.min_ns, self.max_ns) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        }
    }
}

fn nanos_to_duration(ns: f64) -> Duration {
    Duration::from_nanos(ns.round() as u64)
}

fn fmt_ms(ns: f64) -> String {
    format!("{:.6} ms", ns / 1e6)
}

impl fmt::Display for TimerStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min_ns, self.max_ns, self.mean_ns, self.std_dev_ns) {
            (Some(min), Some(max), Some(mean), Some(std_dev)) => {
                writeln!(f, "{}: {} samples", self.name, self.count)?;
                writeln!(f, "  min:     {}", fmt_ms(min as f64))?;
                writeln!(f, "  max:     {}", fmt_ms(max as f64))?;
                writeln!(f, "  mean:    {}", fmt_ms(mean))?;
                write!(f, "  std dev: {}", fmt_ms(std_dev))
            }
            _ => write!(f, "{}: no data (0 samples)", self.name),
        }
    }
}
