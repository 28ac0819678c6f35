//! Real-time worker threads.
//!
//! A [`RealtimeThread`] owns one OS thread from spawn until join. The
//! scheduling policy, priority and CPU affinity are applied from inside the
//! new thread before the entry function runs, so the entry function never
//! executes under the wrong policy.

use crate::backend::{PlatformBackend, SchedulingBackend};
use crate::realtime::{apply_realtime, request_cpu_dma_latency, validate_rt_capabilities, RealtimeStatus};
use pacer_common::config::RealtimeConfig;
use pacer_common::error::{PacerError, PacerResult};
use std::any::Any;
use std::fmt;
use std::fs::File;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Lifecycle of a [`RealtimeThread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Configured, not yet spawned.
    Created,
    /// Entry function running (or finished but not joined).
    Running,
    /// Joined; terminal.
    Joined,
    /// Detached; terminal.
    Detached,
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Joined => write!(f, "JOINED"),
            Self::Detached => write!(f, "DETACHED"),
        }
    }
}

/// Handle to a worker thread running under a real-time policy.
///
/// `T` is the entry function's return value, handed back by [`join`].
///
/// [`join`]: RealtimeThread::join
pub struct RealtimeThread<T, B = PlatformBackend> {
    config: RealtimeConfig,
    /// Moved into the worker on spawn.
    backend: Option<B>,
    handle: Option<JoinHandle<T>>,
    state: ThreadState,
    status: Option<RealtimeStatus>,
    /// Keeps the latency request active until the worker is joined.
    dma_latency: Option<File>,
}

impl<T: Send + 'static> RealtimeThread<T> {
    /// Create a thread handle using the platform scheduling backend.
    #[must_use]
    pub fn new(config: RealtimeConfig) -> Self {
        Self::with_backend(config, PlatformBackend::default())
    }
}

impl<T, B> RealtimeThread<T, B>
where
    T: Send + 'static,
    B: SchedulingBackend + Send + 'static,
{
    /// Create a thread handle using a specific scheduling backend.
    #[must_use]
    pub fn with_backend(config: RealtimeConfig, backend: B) -> Self {
        Self {
            config,
            backend: Some(backend),
            handle: None,
            state: ThreadState::Created,
            status: None,
            dma_latency: None,
        }
    }

    /// Spawn the worker and run `entry` on it.
    ///
    /// Blocks until the worker has applied its scheduling settings and
    /// returns what was actually applied. Settings the OS refuses are
    /// reported as warnings; the worker runs regardless.
    ///
    /// # Errors
    ///
    /// - [`PacerError::Sequence`] if this handle was already spawned.
    /// - [`PacerError::Config`] for an invalid thread name, or when
    ///   `fail_fast` is set and RT scheduling is unavailable.
    /// - [`PacerError::Os`] if the OS cannot create the thread.
    /// - [`PacerError::Fault`] if the worker dies while applying its settings.
    pub fn spawn<F>(&mut self, entry: F) -> PacerResult<RealtimeStatus>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        if self.state != ThreadState::Created {
            return Err(PacerError::Sequence(format!(
                "spawn() called on a thread in state {}",
                self.state
            )));
        }

        if self.config.name.contains('\0') {
            return Err(PacerError::Config(format!(
                "thread name {:?} contains a NUL byte",
                self.config.name
            )));
        }

        if self.config.fail_fast {
            info!("Validating real-time capabilities (fail_fast=true)");
            validate_rt_capabilities(&self.config)?;
        }

        let backend = self
            .backend
            .take()
            .ok_or_else(|| PacerError::Sequence("scheduling backend already consumed".into()))?;
        // Handed over only once the thread exists, so a failed spawn keeps it.
        let (backend_tx, backend_rx) = mpsc::sync_channel::<B>(1);

        let dma_latency = self.config.cpu_dma_latency.and_then(request_cpu_dma_latency);
        let dma_latency_us = dma_latency.as_ref().and(self.config.cpu_dma_latency);

        let (status_tx, status_rx) = mpsc::sync_channel(1);
        let config = self.config.clone();

        info!(
            name = %config.name,
            policy = %config.policy,
            priority = config.priority,
            stack_size = config.stack_size,
            "Spawning real-time thread"
        );

        let spawned = thread::Builder::new()
            .name(config.name.clone())
            .stack_size(config.stack_size)
            .spawn(move || {
                let status = match backend_rx.recv() {
                    Ok(backend) => apply_realtime(&config, &backend),
                    Err(_) => RealtimeStatus::default(),
                };
                // The creator only stops listening if it is itself unwinding
                let _ = status_tx.send(status);
                entry()
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.backend = Some(backend);
                warn!(name = %self.config.name, error = %e, "OS refused to create real-time thread");
                return Err(PacerError::Os(format!("failed to spawn real-time thread: {e}")));
            }
        };
        // Capacity 1 and a single send: never blocks.
        let _ = backend_tx.send(backend);

        self.handle = Some(handle);
        self.state = ThreadState::Running;
        self.dma_latency = dma_latency;

        let mut status = status_rx.recv().map_err(|_| {
            PacerError::Fault("real-time thread exited before applying its settings".into())
        })?;
        status.cpu_dma_latency = dma_latency_us;

        if !status.is_realtime() && self.config.policy.is_realtime() {
            warn!(
                name = %self.config.name,
                "Real-time thread running in degraded mode (normal scheduling)"
            );
        }

        self.status = Some(status.clone());
        Ok(status)
    }

    /// Block until the entry function returns and hand back its result.
    ///
    /// # Errors
    ///
    /// - [`PacerError::Sequence`] if called before [`spawn`], twice, or
    ///   after [`detach`].
    /// - [`PacerError::Fault`] if the entry function panicked.
    ///
    /// [`spawn`]: RealtimeThread::spawn
    /// [`detach`]: RealtimeThread::detach
    pub fn join(&mut self) -> PacerResult<T> {
        let handle = match (self.state, self.handle.take()) {
            (ThreadState::Running, Some(handle)) => handle,
            (state, _) => {
                return Err(PacerError::Sequence(format!(
                    "join() called on a thread in state {state}"
                )))
            }
        };

        debug!(name = %self.config.name, "Joining real-time thread");
        let result = handle.join();

        self.state = ThreadState::Joined;
        self.dma_latency = None;

        result.map_err(|payload| {
            PacerError::Fault(format!(
                "real-time thread '{}' panicked: {}",
                self.config.name,
                panic_message(payload.as_ref())
            ))
        })
    }

    /// Let the worker run to completion on its own.
    ///
    /// # Errors
    ///
    /// Returns [`PacerError::Sequence`] unless the thread is running.
    pub fn detach(&mut self) -> PacerResult<()> {
        if self.state != ThreadState::Running {
            return Err(PacerError::Sequence(format!(
                "detach() called on a thread in state {}",
                self.state
            )));
        }
        // Dropping the JoinHandle detaches the OS thread
        self.handle = None;
        self.state = ThreadState::Detached;
        debug!(name = %self.config.name, "Real-time thread detached");
        Ok(())
    }

    /// Whether the entry function has returned. `false` unless running.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Configuration used at creation.
    #[must_use]
    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Settings applied at spawn, once spawned.
    #[must_use]
    pub fn status(&self) -> Option<&RealtimeStatus> {
        self.status.as_ref()
    }
}

impl<T, B> Drop for RealtimeThread<T, B> {
    fn drop(&mut self) {
        if self.state == ThreadState::Running {
            warn!(name = %self.config.name, "Real-time thread dropped without join; detaching");
        }
    }
}

impl<T, B> fmt::Debug for RealtimeThread<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeThread")
            .field("name", &self.config.name)
            .field("state", &self.state)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
