//! Stage lifecycle shared by every pipeline stage.
//!
//! A stage (reader, processor, writer) moves through
//! `NotStarted → Running → Draining → Stopped`:
//!
//! - [`Stage::start`] spawns the background work and returns immediately.
//! - [`Stage::lazy_shutdown`] waits for that work to finish on its own, or for
//!   the process-wide cancellation token to fire.
//! - [`Stage::shutdown`] asks the work to stop taking new items and waits,
//!   bounded by the stage's shutdown timeout. Work still running after the
//!   timeout is interrupted and finally aborted, so no task outlives its stage.
//!
//! [`StageSupervisor`] implements this contract once; concrete stages own one
//! and hand it their worker futures.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Default budget for a forced shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long interrupted workers get to unwind before they are aborted
const ABORT_GRACE: Duration = Duration::from_millis(500);

/// Start / drain / stop contract of a pipeline stage
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name used in logs and errors
    fn name(&self) -> &'static str;

    /// Launch the background work without waiting for it
    fn start(&self) -> Result<()>;

    /// Wait until the work finishes by itself or the process is cancelled
    ///
    /// # Errors
    ///
    /// [`Error::ShutdownCancelled`] if cancellation fired first.
    async fn lazy_shutdown(&self) -> Result<()>;

    /// Stop taking new work and wait, bounded by the shutdown timeout
    ///
    /// # Errors
    ///
    /// [`Error::ShutdownTimeout`] if the work did not stop in time, or
    /// [`Error::ShutdownCancelled`] if the process was cancelled while waiting.
    async fn shutdown(&self) -> Result<()>;
}

/// Lifecycle state of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Created, `start` not called yet
    NotStarted,
    /// Background work is running
    Running,
    /// A shutdown is waiting for the work to finish
    Draining,
    /// Background work has finished
    Stopped,
}

/// Signals handed to every worker of a stage
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Fires on process-wide cancellation or when a forced shutdown times out.
    /// In-flight work (fetches, queue waits) should abort when it fires.
    pub cancel: CancellationToken,
    /// Fires when the stage is asked to stop taking new work
    pub stop: CancellationToken,
}

impl StageContext {
    /// Whether the worker should exit before picking up another item
    pub fn should_stop(&self) -> bool {
        self.stop.is_cancelled() || self.cancel.is_cancelled()
    }
}

/// Owns a stage's workers, its state and its tokens
pub struct StageSupervisor {
    name: &'static str,
    state: Mutex<StageState>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    /// Process-wide token
    cancel: CancellationToken,
    /// Child of `cancel`, also fired when a forced shutdown times out
    interrupt: CancellationToken,
    stop: CancellationToken,
    shutdown_timeout: Duration,
}

impl StageSupervisor {
    /// Create a supervisor for the named stage
    pub fn new(name: &'static str, cancel: CancellationToken, shutdown_timeout: Duration) -> Self {
        let interrupt = cancel.child_token();
        Self {
            name,
            state: Mutex::new(StageState::NotStarted),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            cancel,
            interrupt,
            stop: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Stage name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> StageState {
        *self.lock_state()
    }

    /// Signals for a worker of this stage
    pub fn context(&self) -> StageContext {
        StageContext {
            cancel: self.interrupt.clone(),
            stop: self.stop.clone(),
        }
    }

    /// Spawn `workers` futures built by `make` and move to `Running`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F, Fut>(&self, workers: usize, mut make: F) -> Result<()>
    where
        F: FnMut(usize, StageContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock_state();
        if *state != StageState::NotStarted {
            return Err(self.invalid("start", *state));
        }

        let mut tasks = self
            .tasks
            .try_lock()
            .map_err(|_| self.invalid("start", *state))?;
        for worker in 0..workers {
            tasks.spawn(make(worker, self.context()));
        }

        *state = StageState::Running;
        tracing::info!(stage = self.name, workers, "stage started");
        Ok(())
    }

    /// Wait for the workers to finish on their own
    pub async fn lazy_shutdown(&self) -> Result<()> {
        if !self.enter_draining("lazy shutdown")? {
            return Ok(());
        }

        let mut tasks = self.tasks.lock().await;
        let finished = tokio::select! {
            biased;
            _ = join_all(self.name, &mut tasks) => true,
            _ = self.cancel.cancelled() => false,
        };

        if finished {
            self.set_state(StageState::Stopped);
            tracing::info!(stage = self.name, "stage drained");
            return Ok(());
        }

        tracing::warn!(stage = self.name, "drain interrupted by cancellation");
        self.reap(&mut tasks, self.shutdown_timeout).await;
        self.set_state(StageState::Stopped);
        Err(Error::ShutdownCancelled { stage: self.name })
    }

    /// Ask the workers to stop taking new work and wait for them
    pub async fn shutdown(&self) -> Result<()> {
        if !self.enter_draining("shutdown")? {
            return Ok(());
        }

        self.stop.cancel();
        tracing::info!(stage = self.name, timeout = ?self.shutdown_timeout, "stage shutting down");

        let drained = async {
            let mut tasks = self.tasks.lock().await;
            join_all(self.name, &mut tasks).await;
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::ShutdownCancelled { stage: self.name }),
            waited = tokio::time::timeout(self.shutdown_timeout, drained) => match waited {
                Ok(()) => Ok(()),
                Err(_) => Err(Error::ShutdownTimeout {
                    stage: self.name,
                    timeout: self.shutdown_timeout,
                }),
            },
        };

        if let Err(e) = &result {
            tracing::warn!(stage = self.name, error = %e, "interrupting stage workers");
            self.interrupt.cancel();
            let mut tasks = self.tasks.lock().await;
            self.reap(&mut tasks, ABORT_GRACE).await;
        } else {
            tracing::info!(stage = self.name, "stage stopped");
        }

        self.set_state(StageState::Stopped);
        result
    }

    /// Join interrupted workers for up to `grace`, then abort the rest
    async fn reap(&self, tasks: &mut JoinSet<()>, grace: Duration) {
        if tokio::time::timeout(grace, join_all(self.name, tasks))
            .await
            .is_err()
        {
            tracing::warn!(stage = self.name, remaining = tasks.len(), "aborting stage workers");
            tasks.abort_all();
            join_all(self.name, tasks).await;
        }
    }

    /// Move to `Draining`; `Ok(false)` if the stage has already stopped
    fn enter_draining(&self, operation: &'static str) -> Result<bool> {
        let mut state = self.lock_state();
        match *state {
            StageState::NotStarted => Err(self.invalid(operation, *state)),
            StageState::Stopped => Ok(false),
            StageState::Running | StageState::Draining => {
                *state = StageState::Draining;
                Ok(true)
            }
        }
    }

    fn set_state(&self, next: StageState) {
        *self.lock_state() = next;
    }

    fn lock_state(&self) -> MutexGuard<'_, StageState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn invalid(&self, operation: &'static str, state: StageState) -> Error {
        Error::InvalidStageState {
            stage: self.name,
            operation,
            state,
        }
    }
}

async fn join_all(stage: &'static str, tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined
            && e.is_panic()
        {
            tracing::error!(stage, error = %e, "stage worker panicked");
        }
    }
}
