//! Platform scheduling backends.
//!
//! The pacing core never calls an OS scheduling API directly. Thread setup
//! goes through [`SchedulingBackend`], and [`PlatformBackend`] selects the
//! implementation for the build target. Every operation acts on the
//! calling thread.

use pacer_common::config::SchedPolicy;
use thiserror::Error;
use tracing::debug;

/// Lowest priority accepted by the fixed-priority RT classes.
pub const MIN_RT_PRIORITY: u8 = 1;
/// Highest priority accepted by the fixed-priority RT classes.
pub const MAX_RT_PRIORITY: u8 = 99;

/// Failure to apply a scheduling setting.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The process lacks the privilege (e.g. `CAP_SYS_NICE`).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The request was rejected as invalid (bad priority, nonexistent CPU).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The platform has no such capability.
    #[error("not supported on this platform")]
    Unsupported,

    /// Any other OS failure.
    #[error("OS error: {0}")]
    Os(String),
}

/// Capability interface for thread scheduling.
pub trait SchedulingBackend {
    /// Switch the calling thread to `policy` at `priority`.
    ///
    /// `priority` is ignored for [`SchedPolicy::Other`].
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses the change.
    fn set_policy(&self, policy: SchedPolicy, priority: u8) -> Result<(), BackendError>;

    /// Change the calling thread's priority within its current policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses the change.
    fn set_priority(&self, priority: u8) -> Result<(), BackendError>;

    /// Restrict the calling thread to the given CPUs.
    ///
    /// # Errors
    ///
    /// Returns an error if the CPU set is invalid or the OS refuses it.
    fn set_affinity(&self, cpus: &[usize]) -> Result<(), BackendError>;
}

/// POSIX scheduling on Linux (`sched_setscheduler`, `sched_setaffinity`).
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxBackend;

#[cfg(target_os = "linux")]
impl LinuxBackend {
    fn os_error(op: &str) -> BackendError {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EPERM) => BackendError::PermissionDenied(format!("{op}: {err}")),
            Some(libc::EINVAL) => BackendError::InvalidArgument(format!("{op}: {err}")),
            _ => BackendError::Os(format!("{op}: {err}")),
        }
    }
}

#[cfg(target_os = "linux")]
impl SchedulingBackend for LinuxBackend {
    fn set_policy(&self, policy: SchedPolicy, priority: u8) -> Result<(), BackendError> {
        let (linux_policy, sched_priority) = match policy {
            SchedPolicy::Fifo => (libc::SCHED_FIFO, i32::from(priority)),
            SchedPolicy::Rr => (libc::SCHED_RR, i32::from(priority)),
            // SCHED_OTHER only accepts priority 0
            SchedPolicy::Other => (libc::SCHED_OTHER, 0),
        };

        debug!(?policy, sched_priority, "sched_setscheduler");

        let param = libc::sched_param { sched_priority };
        // SAFETY: pid 0 targets the calling thread; `param` is a valid sched_param.
        let result = unsafe { libc::sched_setscheduler(0, linux_policy, &param) };
        if result == -1 {
            return Err(Self::os_error("sched_setscheduler"));
        }
        Ok(())
    }

    fn set_priority(&self, priority: u8) -> Result<(), BackendError> {
        debug!(priority, "sched_setparam");

        let param = libc::sched_param {
            sched_priority: i32::from(priority),
        };
        // SAFETY: pid 0 targets the calling thread; `param` is a valid sched_param.
        let result = unsafe { libc::sched_setparam(0, &param) };
        if result == -1 {
            return Err(Self::os_error("sched_setparam"));
        }
        Ok(())
    }

    fn set_affinity(&self, cpus: &[usize]) -> Result<(), BackendError> {
        use nix::errno::Errno;
        use nix::sched::{sched_setaffinity, CpuSet};
        use nix::unistd::Pid;

        debug!(?cpus, "sched_setaffinity");

        let mut cpu_set = CpuSet::new();
        for &cpu in cpus {
            cpu_set
                .set(cpu)
                .map_err(|e| BackendError::InvalidArgument(format!("CPU index {cpu}: {e}")))?;
        }

        sched_setaffinity(Pid::from_raw(0), &cpu_set).map_err(|e| match e {
            Errno::EINVAL => {
                BackendError::InvalidArgument(format!("CPU set {cpus:?} contains no online CPU"))
            }
            Errno::EPERM => BackendError::PermissionDenied(format!("sched_setaffinity: {e}")),
            other => BackendError::Os(format!("sched_setaffinity: {other}")),
        })
    }
}

/// Backend for platforms without POSIX real-time scheduling.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedBackend;

impl SchedulingBackend for UnsupportedBackend {
    fn set_policy(&self, _policy: SchedPolicy, _priority: u8) -> Result<(), BackendError> {
        Err(BackendError::Unsupported)
    }

    fn set_priority(&self, _priority: u8) -> Result<(), BackendError> {
        Err(BackendError::Unsupported)
    }

    fn set_affinity(&self, _cpus: &[usize]) -> Result<(), BackendError> {
        Err(BackendError::Unsupported)
    }
}

/// The scheduling backend for the build target.
#[cfg(target_os = "linux")]
pub type PlatformBackend = LinuxBackend;

/// The scheduling backend for the build target.
#[cfg(not(target_os = "linux"))]
pub type PlatformBackend = UnsupportedBackend;
