//! Configuration structures for real-time pacing.
//!
//! Supports TOML deserialization with defaults matching the classic
//! demonstration: a FIFO thread at priority 80 spinning at 1 kHz.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Top-level pacer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Lock all current and future memory pages before spawning the worker.
    pub lock_memory: bool,

    /// Number of paced iterations the worker runs before returning.
    pub iterations: u64,

    /// Real-time thread configuration.
    pub realtime: RealtimeConfig,

    /// Loop pacing configuration.
    pub spinner: SpinnerConfig,

    /// Timing measurement configuration.
    pub timer: TimerConfig,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            lock_memory: true,
            iterations: 1000,
            realtime: RealtimeConfig::default(),
            spinner: SpinnerConfig::default(),
            timer: TimerConfig::default(),
        }
    }
}

/// Real-time thread configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// OS-visible thread name.
    pub name: String,

    /// Scheduler policy: "fifo", "rr" (round-robin) or "other".
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,

    /// CPU affinity for the RT thread.
    pub cpu_affinity: CpuAffinity,

    /// Stack size of the spawned thread in bytes.
    pub stack_size: usize,

    /// Stack bytes to pre-fault before the entry function runs.
    pub prefault_stack_size: usize,

    /// Maximum CPU wake-up latency in microseconds requested through
    /// `/dev/cpu_dma_latency` while the thread runs. `None` leaves it alone.
    ///
    /// Defaults to `None`, unlike the classic real-time tooling default of
    /// `0` (best possible latency), which keeps every core out of idle
    /// states; set `Some(0)` to get that behavior.
    pub cpu_dma_latency: Option<i32>,

    /// Fail at spawn time if RT requirements cannot be met instead of
    /// degrading to normal scheduling.
    pub fail_fast: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            name: String::from("real_time_thread"),
            policy: SchedPolicy::Fifo,
            priority: 80,
            cpu_affinity: CpuAffinity::None,
            stack_size: 8 * 1024 * 1024, // 8 MiB
            prefault_stack_size: 64 * 1024, // 64 KiB
            cpu_dma_latency: None,
            fail_fast: false,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    Other,
}

impl SchedPolicy {
    /// Whether this is a fixed-priority real-time class.
    #[must_use]
    pub fn is_realtime(self) -> bool {
        matches!(self, Self::Fifo | Self::Rr)
    }
}

impl fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fifo => write!(f, "fifo"),
            Self::Rr => write!(f, "rr"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl FromStr for SchedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "rr" | "round_robin" | "round-robin" => Ok(Self::Rr),
            "other" => Ok(Self::Other),
            _ => Err(format!("unknown scheduler policy '{s}' (expected fifo, rr or other)")),
        }
    }
}

/// CPU affinity specification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CpuAffinity {
    /// No affinity set (OS chooses).
    #[default]
    None,
    /// Pin to a single CPU core.
    Single(usize),
    /// Pin to a set of CPU cores.
    Set(Vec<usize>),
}

impl CpuAffinity {
    /// The CPUs to pin to; empty when no affinity is requested.
    #[must_use]
    pub fn cpus(&self) -> Vec<usize> {
        match self {
            Self::None => Vec::new(),
            Self::Single(cpu) => vec![*cpu],
            Self::Set(cpus) => cpus.clone(),
        }
    }
}

impl From<Vec<usize>> for CpuAffinity {
    fn from(cpus: Vec<usize>) -> Self {
        match cpus.as_slice() {
            [] => Self::None,
            [cpu] => Self::Single(*cpu),
            _ => Self::Set(cpus),
        }
    }
}

impl Serialize for CpuAffinity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CpuAffinity::None => serializer.serialize_none(),
            CpuAffinity::Single(cpu) => serializer.serialize_u64(*cpu as u64),
            CpuAffinity::Set(cpus) => cpus.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CpuAffinity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct CpuAffinityVisitor;

        impl<'de> Visitor<'de> for CpuAffinityVisitor {
            type Value = CpuAffinity;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("null, an integer, or an array of integers")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::None)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(de::Error::custom("CPU index cannot be negative"));
                }
                Ok(CpuAffinity::Single(value as usize))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut cpus = Vec::new();
                while let Some(cpu) = seq.next_element::<usize>()? {
                    cpus.push(cpu);
                }
                Ok(CpuAffinity::Set(cpus))
            }
        }

        deserializer.deserialize_any(CpuAffinityVisitor)
    }
}

/// How the spinner waits for the next deadline.
///
/// | Strategy | Latency                         | CPU usage                  |
/// |----------|---------------------------------|----------------------------|
/// | `Sleep`  | kernel wake-up jitter           | idle between ticks         |
/// | `Hybrid` | sub-microsecond on a quiet core | one core for the threshold |
/// | `Busy`   | best achievable                 | one core, always           |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    /// Absolute sleep on the monotonic clock.
    #[default]
    Sleep,
    /// Sleep until `spin_threshold` before the deadline, then busy-wait.
    Hybrid,
    /// Busy-wait the whole period.
    Busy,
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sleep => write!(f, "sleep"),
            Self::Hybrid => write!(f, "hybrid"),
            Self::Busy => write!(f, "busy"),
        }
    }
}

impl FromStr for WaitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sleep" => Ok(Self::Sleep),
            "hybrid" => Ok(Self::Hybrid),
            "busy" => Ok(Self::Busy),
            _ => Err(format!("unknown wait strategy '{s}' (expected sleep, hybrid or busy)")),
        }
    }
}

/// Loop pacing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpinnerConfig {
    /// Target loop frequency in hertz.
    pub frequency_hz: f64,

    /// How to wait for each deadline.
    pub strategy: WaitStrategy,

    /// Busy-wait window before each deadline when using `Hybrid`.
    #[serde(with = "humantime_serde")]
    pub spin_threshold: Duration,
}

impl Default for SpinnerConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 1000.0,
            strategy: WaitStrategy::Sleep,
            spin_threshold: Duration::from_micros(200),
        }
    }
}

/// Timing measurement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Label printed in the statistics report.
    pub name: String,

    /// Number of recent durations retained for percentiles and dumps.
    pub history_size: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            name: String::from("timer"),
            history_size: 10_000,
        }
    }
}

impl PacerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
