//! Real-time scheduling and memory locking utilities.
//!
//! Provides platform-specific setup for deterministic execution:
//! - Memory locking (mlockall) to prevent page faults
//! - Stack pre-faulting to ensure stack pages are resident
//! - Real-time scheduling (SCHED_FIFO/SCHED_RR) for priority execution
//! - CPU affinity to isolate RT threads from system housekeeping
//! - CPU DMA latency requests to keep cores out of deep idle states
//!
//! Every refusal by the OS degrades to best-effort operation with a warning.
//! Real-time behavior is an enhancement, never a precondition.

use crate::backend::{BackendError, SchedulingBackend, MAX_RT_PRIORITY, MIN_RT_PRIORITY};
use pacer_common::config::{RealtimeConfig, SchedPolicy};
use pacer_common::error::{PacerError, PacerResult};
use std::fs::File;
use tracing::{debug, error, info, warn};

/// Outcome of [`lock_process_memory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryLockStatus {
    /// All current and future pages are pinned.
    Locked,
    /// The OS refused; pages may be swapped and page faults may occur.
    Degraded {
        /// Why the lock could not be applied.
        reason: String,
    },
}

impl MemoryLockStatus {
    /// Whether memory is actually locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

/// Settings actually applied to a real-time thread.
///
/// `None` fields were either not requested or refused by the OS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeStatus {
    /// Applied scheduler policy.
    pub scheduler_policy: Option<SchedPolicy>,
    /// Applied scheduler priority.
    pub scheduler_priority: Option<u8>,
    /// CPUs the thread is pinned to.
    pub cpu_affinity: Option<Vec<usize>>,
    /// Stack bytes pre-faulted.
    pub stack_prefaulted: usize,
    /// CPU DMA latency held while the thread runs, in microseconds.
    pub cpu_dma_latency: Option<i32>,
}

impl RealtimeStatus {
    /// Whether the thread runs under a fixed-priority real-time class.
    #[must_use]
    pub fn is_realtime(&self) -> bool {
        self.scheduler_policy.is_some_and(SchedPolicy::is_realtime)
    }
}

/// Lock all current and future memory pages of the process.
///
/// Process-wide and irreversible. Calling it again re-applies the same lock.
/// Never fails: a refusal is logged and reported as
/// [`MemoryLockStatus::Degraded`].
#[cfg(target_os = "linux")]
pub fn lock_process_memory() -> MemoryLockStatus {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    debug!("Locking memory pages with mlockall");

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Memory locked successfully");
            MemoryLockStatus::Locked
        }
        Err(e) => {
            // EPERM is common when not running as root or without CAP_IPC_LOCK,
            // ENOMEM when RLIMIT_MEMLOCK is smaller than the resident set.
            warn!(
                error = %e,
                "mlockall failed - continuing without locked memory. \
                 Page faults may occur during execution."
            );
            MemoryLockStatus::Degraded {
                reason: format!("mlockall failed: {e}"),
            }
        }
    }
}

/// Lock all current and future memory pages of the process.
#[cfg(not(target_os = "linux"))]
pub fn lock_process_memory() -> MemoryLockStatus {
    warn!("mlockall not available on this platform");
    MemoryLockStatus::Degraded {
        reason: "memory locking not supported on this platform".into(),
    }
}

/// Pre-fault stack pages to avoid page faults during execution.
///
/// Touches `size` bytes of the calling thread's stack, one frame at a time,
/// so they are resident before the RT loop begins. Returns the number of
/// bytes touched.
pub fn prefault_stack(size: usize) -> usize {
    if size == 0 {
        return 0;
    }

    debug!(size, "Pre-faulting stack pages");
    let total_faulted = prefault_stack_recursive(size, 0);
    debug!(total_faulted, "Stack pre-fault complete");
    total_faulted
}

/// Recursive helper to actually fault stack pages.
#[inline(never)]
fn prefault_stack_recursive(remaining: usize, depth: usize) -> usize {
    const FRAME_SIZE: usize = 4096; // Approximate stack frame size
    const MAX_DEPTH: usize = 1000; // Limit recursion depth

    if remaining < FRAME_SIZE || depth >= MAX_DEPTH {
        return 0;
    }

    let mut buffer = [0u8; FRAME_SIZE];

    // SAFETY: Writing to our own stack allocation
    unsafe {
        std::ptr::write_volatile(buffer.as_mut_ptr(), 0xBB);
        std::ptr::write_volatile(buffer.as_mut_ptr().add(FRAME_SIZE - 1), 0xCC);
    }

    // Prevent the buffer from being optimized away
    std::hint::black_box(&buffer);

    FRAME_SIZE + prefault_stack_recursive(remaining - FRAME_SIZE, depth + 1)
}

/// Get system page size.
#[must_use]
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf is safe to call
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    }
    #[cfg(not(unix))]
    {
        4096 // Default assumption
    }
}

/// Apply the scheduling part of `config` to the calling thread.
///
/// Each refused setting is logged as a warning and left out of the returned
/// status; the thread keeps running under whatever the OS allowed.
pub fn apply_realtime<B: SchedulingBackend>(config: &RealtimeConfig, backend: &B) -> RealtimeStatus {
    let (scheduler_policy, scheduler_priority) = set_scheduler(backend, config.policy, config.priority);
    let cpu_affinity = set_cpu_affinity(backend, &config.cpu_affinity.cpus());
    let stack_prefaulted = prefault_stack(prefault_budget(config));

    let status = RealtimeStatus {
        scheduler_policy,
        scheduler_priority,
        cpu_affinity,
        stack_prefaulted,
        cpu_dma_latency: None,
    };

    debug!(?status, thread = ?std::thread::current().name(), "Real-time settings applied");
    status
}

/// Stack bytes that can be pre-faulted without overflowing a thread
/// created with `config.stack_size`.
///
/// At most half the stack is touched; the rest is left for the setup code
/// and the entry function.
#[must_use]
pub fn prefault_budget(config: &RealtimeConfig) -> usize {
    let limit = config.stack_size / 2;
    if config.prefault_stack_size > limit {
        warn!(
            requested = config.prefault_stack_size,
            stack_size = config.stack_size,
            clamped = limit,
            "Stack pre-fault exceeds half the thread stack, clamping"
        );
        return limit;
    }
    config.prefault_stack_size
}

fn set_scheduler<B: SchedulingBackend>(
    backend: &B,
    policy: SchedPolicy,
    priority: u8,
) -> (Option<SchedPolicy>, Option<u8>) {
    if !policy.is_realtime() {
        return match backend.set_policy(SchedPolicy::Other, 0) {
            Ok(()) => {
                debug!("Using SCHED_OTHER (non-RT) scheduling");
                (Some(SchedPolicy::Other), None)
            }
            Err(e) => {
                warn!(error = %e, "Could not select SCHED_OTHER scheduling");
                (None, None)
            }
        };
    }

    let clamped_priority = priority.clamp(MIN_RT_PRIORITY, MAX_RT_PRIORITY);
    if clamped_priority != priority {
        warn!(
            original = priority,
            clamped = clamped_priority,
            "Scheduler priority clamped to valid range"
        );
    }

    match backend.set_policy(policy, clamped_priority) {
        Ok(()) => {
            info!(?policy, priority = clamped_priority, "Real-time scheduler configured");
            (Some(policy), Some(clamped_priority))
        }
        Err(BackendError::PermissionDenied(detail)) => {
            warn!(
                %detail,
                "Real-time scheduling denied - running with normal scheduling. \
                 Consider running with CAP_SYS_NICE capability or as root."
            );
            (None, None)
        }
        Err(e) => {
            warn!(error = %e, ?policy, "Real-time scheduling unavailable - running with normal scheduling");
            (None, None)
        }
    }
}

fn set_cpu_affinity<B: SchedulingBackend>(backend: &B, cpus: &[usize]) -> Option<Vec<usize>> {
    if cpus.is_empty() {
        debug!("No CPU affinity configured");
        return None;
    }

    match backend.set_affinity(cpus) {
        Ok(()) => {
            info!(?cpus, "CPU affinity set");
            Some(cpus.to_vec())
        }
        Err(e) => {
            warn!(?cpus, error = %e, "CPU affinity not applied - thread may migrate between cores");
            None
        }
    }
}

/// Ask the kernel to keep CPU wake-up latency at or below `latency_us`.
///
/// The request lasts as long as the returned file stays open.
#[cfg(target_os = "linux")]
pub fn request_cpu_dma_latency(latency_us: i32) -> Option<File> {
    use std::io::Write;

    const PATH: &str = "/dev/cpu_dma_latency";

    let opened = std::fs::OpenOptions::new().write(true).open(PATH);
    let result = opened.and_then(|mut file| {
        file.write_all(&latency_us.to_ne_bytes())?;
        Ok(file)
    });

    match result {
        Ok(file) => {
            info!(latency_us, "CPU DMA latency requested");
            Some(file)
        }
        Err(e) => {
            warn!(latency_us, error = %e, "Could not set {PATH} - CPU may enter deep idle states");
            None
        }
    }
}

/// Ask the kernel to keep CPU wake-up latency at or below `latency_us`.
#[cfg(not(target_os = "linux"))]
pub fn request_cpu_dma_latency(latency_us: i32) -> Option<File> {
    warn!(latency_us, "CPU DMA latency control not available on this platform");
    None
}

/// Check if the current process has real-time capabilities.
#[cfg(target_os = "linux")]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    use std::fs;

    let mut caps = RtCapabilities {
        // SAFETY: geteuid has no preconditions
        is_root: unsafe { libc::geteuid() } == 0,
        ..Default::default()
    };

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlim` is a valid, writable rlimit
    if unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut rlim) } == 0 {
        caps.rtprio_limit = Some(rlim.rlim_cur);
    }

    // SAFETY: `rlim` is a valid, writable rlimit
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) } == 0 {
        caps.memlock_limit = Some(rlim.rlim_cur);
    }

    if let Ok(version) = fs::read_to_string("/proc/version") {
        caps.preempt_rt = version.contains("PREEMPT_RT") || version.contains("PREEMPT RT");
    }

    caps
}

/// Check if the current process has real-time capabilities.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}

/// Information about real-time capabilities of the system.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    /// Whether running as root.
    pub is_root: bool,
    /// RLIMIT_RTPRIO value (max RT priority allowed).
    pub rtprio_limit: Option<u64>,
    /// RLIMIT_MEMLOCK value (max lockable memory).
    pub memlock_limit: Option<u64>,
    /// Whether running on a PREEMPT_RT kernel.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Check if RT scheduling is likely to succeed.
    #[must_use]
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }

    /// Check if memory locking is likely to succeed.
    #[must_use]
    pub fn can_lock_memory(&self) -> bool {
        if self.is_root {
            return true;
        }

        #[cfg(target_family = "unix")]
        {
            self.memlock_limit.is_some_and(|l| l == libc::RLIM_INFINITY)
        }

        #[cfg(not(target_family = "unix"))]
        {
            false
        }
    }
}

/// Validate that real-time scheduling is available for `config`.
///
/// Called by the thread spawner when `fail_fast` is set.
///
/// # Errors
///
/// Returns [`PacerError::Config`] if an RT policy is requested but neither
/// root nor a positive `RLIMIT_RTPRIO` is available.
pub fn validate_rt_capabilities(config: &RealtimeConfig) -> PacerResult<()> {
    let caps = check_rt_capabilities();

    if !caps.preempt_rt {
        // Vanilla kernels still work for soft real-time
        warn!(
            "PREEMPT_RT kernel not detected. Real-time performance may be degraded. \
             For hard deadlines, use a kernel with PREEMPT_RT patches."
        );
    }

    if config.policy.is_realtime() && !caps.can_use_rt_scheduling() {
        let message = format!(
            "Real-time requirements not met (fail_fast=true): cannot use SCHED_{} \
             (RLIMIT_RTPRIO={:?}, is_root={}). Grant CAP_SYS_NICE capability or set RLIMIT_RTPRIO > 0.",
            config.policy.to_string().to_uppercase(),
            caps.rtprio_limit,
            caps.is_root
        );
        error!("{}", message);
        return Err(PacerError::Config(message));
    }

    info!("Real-time capabilities validated successfully");
    Ok(())
}
