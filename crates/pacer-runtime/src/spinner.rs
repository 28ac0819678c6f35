//! Fixed-frequency loop pacing.
//!
//! A [`Spinner`] holds a loop to a target frequency:
//!
//! ```text
//! Uninitialized --set_frequency(f)--> Armed --spin()--> Ticking
//!                                       ^                  |
//!                                       +--set_frequency---+
//! ```
//!
//! Deadlines advance by exactly one period per tick, so jitter in one wake-up
//! does not shift the ones after it. A call that arrives more than one full
//! period late resynchronizes to `now + period` instead of firing a backlog.

use pacer_common::config::{SpinnerConfig, WaitStrategy};
use pacer_common::error::{PacerError, PacerResult};
use pacer_common::time::{Clock, ClockReading, MonotonicClock};
use std::time::Duration;
use tracing::{debug, trace};

/// Blocks the calling thread until the next tick of a fixed-rate schedule.
#[derive(Debug)]
pub struct Spinner<C: Clock = MonotonicClock> {
    clock: C,
    /// Tick period; `None` until a frequency is set.
    period: Option<Duration>,
    /// When the next tick fires; `None` until the first spin after arming.
    next_deadline: Option<ClockReading>,
    strategy: WaitStrategy,
    /// Busy-wait window for [`WaitStrategy::Hybrid`].
    spin_threshold: Duration,
    ticks: u64,
    missed_deadlines: u64,
}

impl Spinner {
    /// Create an unarmed spinner on the monotonic clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock)
    }

    /// Create an armed spinner from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PacerError::InvalidFrequency`] if `frequency_hz` is not a
    /// finite positive number.
    pub fn from_config(config: &SpinnerConfig) -> PacerResult<Self> {
        let mut spinner = Self::new();
        spinner.set_strategy(config.strategy);
        spinner.set_spin_threshold(config.spin_threshold);
        spinner.set_frequency(config.frequency_hz)?;
        Ok(spinner)
    }
}

impl Default for Spinner {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Spinner<C> {
    /// Create an unarmed spinner reading time from `clock`.
    pub fn with_clock(clock: C) -> Self {
        let defaults = SpinnerConfig::default();
        Self {
            clock,
            period: None,
            next_deadline: None,
            strategy: defaults.strategy,
            spin_threshold: defaults.spin_threshold,
            ticks: 0,
            missed_deadlines: 0,
        }
    }

    /// Set the target frequency in hertz.
    ///
    /// Pacing restarts from the next [`spin`](Self::spin).
    ///
    /// # Errors
    ///
    /// Returns [`PacerError::InvalidFrequency`] if `frequency_hz` is zero,
    /// negative, not finite, or so high that the period rounds to zero.
    pub fn set_frequency(&mut self, frequency_hz: f64) -> PacerResult<()> {
        if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
            return Err(PacerError::InvalidFrequency(frequency_hz));
        }

        let period = Duration::try_from_secs_f64(frequency_hz.recip())
            .map_err(|_| PacerError::InvalidFrequency(frequency_hz))?;
        if period.is_zero() {
            return Err(PacerError::InvalidFrequency(frequency_hz));
        }

        debug!(frequency_hz, period_ns = period.as_nanos(), "Spinner frequency set");
        self.arm(period);
        Ok(())
    }

    /// Set the tick period directly.
    ///
    /// # Errors
    ///
    /// Returns [`PacerError::Config`] for a zero period.
    pub fn set_period(&mut self, period: Duration) -> PacerResult<()> {
        if period.is_zero() {
            return Err(PacerError::Config("spinner period must be non-zero".into()));
        }
        debug!(period_ns = period.as_nanos(), "Spinner period set");
        self.arm(period);
        Ok(())
    }

    fn arm(&mut self, period: Duration) {
        self.period = Some(period);
        self.next_deadline = None;
    }

    /// Choose how to wait for deadlines.
    pub fn set_strategy(&mut self, strategy: WaitStrategy) {
        self.strategy = strategy;
    }

    /// Set the busy-wait window used by [`WaitStrategy::Hybrid`].
    pub fn set_spin_threshold(&mut self, threshold: Duration) {
        self.spin_threshold = threshold;
    }

    /// Block until the next tick.
    ///
    /// The first call after arming starts the schedule and returns
    /// immediately. Overruns are absorbed silently; they show up in
    /// [`missed_deadlines`](Self::missed_deadlines) and in any timer wrapped
    /// around the loop.
    ///
    /// # Errors
    ///
    /// Returns [`PacerError::Sequence`] if no frequency has been set.
    pub fn spin(&mut self) -> PacerResult<()> {
        let period = self.period.ok_or_else(|| {
            PacerError::Sequence("spin() called before set_frequency()".into())
        })?;

        let Some(deadline) = self.next_deadline else {
            self.next_deadline = Some(self.clock.now() + period);
            self.ticks += 1;
            return Ok(());
        };

        let mut now = self.clock.now();
        if now < deadline {
            now = self.wait_until(deadline);
        }

        let lateness = now - deadline;
        let next = if lateness > period {
            self.missed_deadlines += 1;
            trace!(
                lateness_us = lateness.as_micros(),
                period_us = period.as_micros(),
                "Missed deadline, resynchronizing"
            );
            now + period
        } else {
            deadline + period
        };

        self.next_deadline = Some(next);
        self.ticks += 1;
        Ok(())
    }

    /// Wait for `deadline` and return the wake-up time.
    fn wait_until(&self, deadline: ClockReading) -> ClockReading {
        match self.strategy {
            WaitStrategy::Sleep => {
                self.clock.sleep_until(deadline);
                self.clock.now()
            }
            WaitStrategy::Hybrid => {
                let coarse = deadline.saturating_sub(self.spin_threshold);
                if self.clock.now() < coarse {
                    self.clock.sleep_until(coarse);
                }
                self.busy_wait(deadline)
            }
            WaitStrategy::Busy => self.busy_wait(deadline),
        }
    }

    fn busy_wait(&self, deadline: ClockReading) -> ClockReading {
        loop {
            let now = self.clock.now();
            if now >= deadline {
                return now;
            }
            std::hint::spin_loop();
        }
    }

    /// Tick period, once armed.
    #[must_use]
    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Target frequency in hertz, once armed.
    #[must_use]
    pub fn frequency(&self) -> Option<f64> {
        self.period.map(|p| p.as_secs_f64().recip())
    }

    /// When the next tick fires, once the schedule has started.
    #[must_use]
    pub fn next_deadline(&self) -> Option<ClockReading> {
        self.next_deadline
    }

    /// Current wait strategy.
    #[must_use]
    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    /// Number of completed `spin()` calls.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Number of times the schedule was resynchronized after an overrun.
    #[must_use]
    pub fn missed_deadlines(&self) -> u64 {
        self.missed_deadlines
    }
}
