//! Real-time thread and memory lock acceptance tests.
//!
//! # Requirements (ignored tests)
//!
//! - Root privileges or CAP_SYS_NICE + CAP_IPC_LOCK

use super::common::{check_rt_prerequisites, is_root};
use pacer_common::config::{RealtimeConfig, SchedPolicy};
use pacer_common::error::PacerError;
use pacer_runtime::realtime::{check_rt_capabilities, lock_process_memory};
use pacer_runtime::thread::{RealtimeThread, ThreadState};

/// Without privileges the worker still runs, under normal scheduling.
#[test]
fn test_thread_degrades_without_privilege() {
    if check_rt_capabilities().can_use_rt_scheduling() {
        eprintln!("Skipping test: process may use RT scheduling");
        return;
    }

    let mut worker = RealtimeThread::new(RealtimeConfig::default());
    let status = worker.spawn(|| 6 * 7).expect("spawn failed");

    assert!(!status.is_realtime());
    assert_eq!(worker.join().unwrap(), 42);
    assert_eq!(worker.state(), ThreadState::Joined);
}

/// `fail_fast` turns missing privileges into a spawn error.
#[test]
fn test_fail_fast_rejects_without_privilege() {
    if check_rt_capabilities().can_use_rt_scheduling() {
        eprintln!("Skipping test: process may use RT scheduling");
        return;
    }

    let config = RealtimeConfig {
        fail_fast: true,
        ..Default::default()
    };
    let mut worker = RealtimeThread::<()>::new(config);
    let err = worker.spawn(|| ()).unwrap_err();

    assert!(matches!(err, PacerError::Config(_)));
    assert_eq!(worker.state(), ThreadState::Created);
}

/// The worker carries its configured name.
#[test]
fn test_thread_name_and_stack() {
    let config = RealtimeConfig {
        name: "pacer-accept".into(),
        policy: SchedPolicy::Other,
        stack_size: 2 * 1024 * 1024,
        prefault_stack_size: 256 * 1024,
        ..Default::default()
    };
    let mut worker = RealtimeThread::new(config);
    let status = worker
        .spawn(|| std::thread::current().name().map(str::to_owned))
        .expect("spawn failed");

    assert_eq!(status.stack_prefaulted, 256 * 1024);
    assert_eq!(worker.join().unwrap().as_deref(), Some("pacer-accept"));
}

/// As root the worker really runs under SCHED_FIFO at the requested priority.
#[test]
#[ignore = "Requires root or CAP_SYS_NICE"]
fn test_realtime_thread_gets_fifo() {
    if let Err(e) = check_rt_prerequisites() {
        eprintln!("Skipping test: {}", e);
        return;
    }

    let config = RealtimeConfig {
        policy: SchedPolicy::Fifo,
        priority: 80,
        fail_fast: true,
        ..Default::default()
    };
    let mut worker = RealtimeThread::new(config);
    let status = worker
        .spawn(|| {
            let mut param = libc::sched_param { sched_priority: 0 };
            // SAFETY: pid 0 is the calling thread; `param` is writable.
            let policy = unsafe { libc::sched_getscheduler(0) };
            unsafe { libc::sched_getparam(0, &mut param) };
            (policy, param.sched_priority)
        })
        .expect("spawn failed");

    assert_eq!(status.scheduler_policy, Some(SchedPolicy::Fifo));
    assert_eq!(status.scheduler_priority, Some(80));
    assert_eq!(worker.join().unwrap(), (libc::SCHED_FIFO, 80));
}

/// As root memory locking succeeds.
#[test]
#[ignore = "Requires root or CAP_IPC_LOCK"]
fn test_memory_lock_as_root() {
    if !is_root() {
        eprintln!("Skipping test: not running as root");
        return;
    }

    let status = lock_process_memory();
    assert!(status.is_locked(), "mlockall refused: {status:?}");
}
