//! Monotonic clock source.
//!
//! All pacing and measurement code reads time through the [`Clock`] trait so
//! that the policy logic can be exercised against a [`ManualClock`] in tests.
//! On Linux the production clock is `CLOCK_MONOTONIC`, read with
//! `clock_gettime` and slept on with `clock_nanosleep(TIMER_ABSTIME)`, which
//! avoids the drift a relative sleep accumulates.

use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// An opaque monotonic timestamp with nanosecond resolution.
///
/// Only differences between readings are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClockReading(u64);

impl ClockReading {
    /// Build a reading from a raw nanosecond count.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Raw nanosecond count of this reading.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    #[must_use]
    pub fn saturating_duration_since(self, earlier: ClockReading) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Move this reading back by `duration`, stopping at zero.
    #[must_use]
    pub fn saturating_sub(self, duration: Duration) -> ClockReading {
        Self(self.0.saturating_sub(duration_to_nanos(duration)))
    }

    #[cfg(target_os = "linux")]
    fn from_timespec(ts: &libc::timespec) -> Self {
        Self(ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64)
    }

    #[cfg(target_os = "linux")]
    fn to_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: (self.0 / NANOS_PER_SEC) as libc::time_t,
            tv_nsec: (self.0 % NANOS_PER_SEC) as libc::c_long,
        }
    }
}

impl Add<Duration> for ClockReading {
    type Output = ClockReading;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(duration_to_nanos(rhs)))
    }
}

impl Sub for ClockReading {
    type Output = Duration;

    fn sub(self, rhs: ClockReading) -> Self::Output {
        self.saturating_duration_since(rhs)
    }
}

fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// A monotonic time source that can also block until a deadline.
pub trait Clock {
    /// Read the current time. Never goes backward.
    fn now(&self) -> ClockReading;

    /// Block the calling thread until `deadline` has been reached.
    ///
    /// Returns immediately if the deadline is already in the past.
    fn sleep_until(&self, deadline: ClockReading);
}

/// The process-wide monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

#[cfg(target_os = "linux")]
impl Clock for MonotonicClock {
    /// # Panics
    ///
    /// Panics if `CLOCK_MONOTONIC` cannot be read; pacing has no meaningful
    /// fallback without it.
    #[inline]
    fn now(&self) -> ClockReading {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            tracing::error!(%err, "clock_gettime(CLOCK_MONOTONIC) failed");
            panic!("clock_gettime(CLOCK_MONOTONIC) failed: {err}");
        }
        ClockReading::from_timespec(&ts)
    }

    /// # Panics
    ///
    /// Panics if `clock_nanosleep` fails with anything other than `EINTR`.
    fn sleep_until(&self, deadline: ClockReading) {
        let ts = deadline.to_timespec();
        loop {
            // SAFETY: `ts` is a valid timespec; the remain pointer may be null with TIMER_ABSTIME.
            let rc = unsafe {
                libc::clock_nanosleep(
                    libc::CLOCK_MONOTONIC,
                    libc::TIMER_ABSTIME,
                    &ts,
                    std::ptr::null_mut(),
                )
            };
            match rc {
                0 => return,
                // Absolute deadline, so retrying after a signal cannot oversleep.
                libc::EINTR => continue,
                errno => {
                    let err = std::io::Error::from_raw_os_error(errno);
                    tracing::error!(%err, "clock_nanosleep(CLOCK_MONOTONIC) failed");
                    panic!("clock_nanosleep(CLOCK_MONOTONIC) failed: {err}");
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn epoch() -> std::time::Instant {
    static EPOCH: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    *EPOCH.get_or_init(std::time::Instant::now)
}

#[cfg(not(target_os = "linux"))]
impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> ClockReading {
        ClockReading(duration_to_nanos(epoch().elapsed()))
    }

    /// Relative sleeps may wake early; loop until the deadline is really reached.
    fn sleep_until(&self, deadline: ClockReading) {
        loop {
            let now = self.now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(deadline - now);
        }
    }
}

/// Read the process-wide monotonic clock.
#[inline]
#[must_use]
pub fn now() -> ClockReading {
    MonotonicClock.now()
}

/// Sleep for `duration` on the monotonic clock.
pub fn sleep(duration: Duration) {
    let clock = MonotonicClock;
    clock.sleep_until(clock.now() + duration);
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and give
/// another to the component under test. Sleeping jumps the clock forward to
/// the deadline instead of blocking.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a manual clock starting at `start`.
    #[must_use]
    pub fn new(start: ClockReading) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(start.as_nanos())),
        }
    }

    /// Move time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration_to_nanos(duration), Ordering::AcqRel);
    }

    /// Move time forward to `reading`. Earlier readings are ignored.
    pub fn advance_to(&self, reading: ClockReading) {
        self.nanos.fetch_max(reading.as_nanos(), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> ClockReading {
        ClockReading(self.nanos.load(Ordering::Acquire))
    }

    fn sleep_until(&self, deadline: ClockReading) {
        self.advance_to(deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_never_goes_backward() {
        let mut last = now();
        for _ in 0..10_000 {
            let current = now();
            assert!(current >= last);
            last = current;
        }
    }

    #[test]
    fn test_resolution_is_sub_millisecond() {
        // Back-to-back reads must be distinguishable well below 1 ms.
        let start = now();
        let mut current = now();
        while current == start {
            current = now();
        }
        assert!(current - start < Duration::from_millis(1));
    }

    #[test]
    fn test_sleep_until_reaches_deadline() {
        let clock = MonotonicClock;
        let deadline = clock.now() + Duration::from_millis(5);
        clock.sleep_until(deadline);
        assert!(clock.now() >= deadline);
    }

    #[test]
    fn test_sleep_until_past_deadline_returns() {
        let clock = MonotonicClock;
        let past = clock.now();
        sleep(Duration::from_millis(1));
        let before = clock.now();
        clock.sleep_until(past);
        assert!(clock.now() - before < Duration::from_millis(50));
    }

    #[test]
    fn test_reading_arithmetic() {
        let a = ClockReading::from_nanos(1_500);
        let b = a + Duration::from_nanos(500);
        assert_eq!(b.as_nanos(), 2_000);
        assert_eq!(b - a, Duration::from_nanos(500));
        // Differences saturate instead of wrapping.
        assert_eq!(a - b, Duration::ZERO);
        assert_eq!(a.saturating_sub(Duration::from_secs(1)).as_nanos(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_timespec_conversion() {
        let reading = ClockReading::from_nanos(3 * NANOS_PER_SEC + 1_005_601);
        let ts = reading.to_timespec();
        assert_eq!(ts.tv_sec, 3);
        assert_eq!(ts.tv_nsec, 1_005_601);
        assert_eq!(ClockReading::from_timespec(&ts), reading);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(ClockReading::from_nanos(0));
        let handle = clock.clone();
        handle.advance(Duration::from_millis(3));
        assert_eq!(clock.now(), ClockReading::from_nanos(3_000_000));

        clock.sleep_until(ClockReading::from_nanos(5_000_000));
        assert_eq!(handle.now(), ClockReading::from_nanos(5_000_000));

        // Sleeping to the past leaves time untouched.
        clock.sleep_until(ClockReading::from_nanos(1));
        assert_eq!(handle.now(), ClockReading::from_nanos(5_000_000));
    }
}
