//! Fetch processor: a pool of workers between the input and output queues.
//!
//! Every worker owns a clone of the [`Fetcher`] (sharing the client's
//! connection pool) and loops: pop a task, fetch it if it is ready, push it
//! downstream. Tasks that are not ready are forwarded untouched. A worker exits
//! when the input queue is closed and drained, when the stage is asked to stop
//! or when it is interrupted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::error::Result;
use crate::fetcher::{FetchRequest, Fetcher};
use crate::queue::TaskQueue;
use crate::stage::{Stage, StageContext, StageSupervisor};
use crate::types::Task;

const STAGE_NAME: &str = "processor";

/// Worker pool stage
pub struct FetchProcessor {
    supervisor: StageSupervisor,
    workers: usize,
    input: Arc<TaskQueue>,
    output: Arc<TaskQueue>,
    fetcher: Fetcher,
    retry_wait: (Duration, Duration),
}

impl FetchProcessor {
    /// Create a processor with `workers` workers
    ///
    /// Backoff bounds and the shutdown budget come from `settings`.
    pub fn new(
        input: Arc<TaskQueue>,
        output: Arc<TaskQueue>,
        fetcher: Fetcher,
        workers: usize,
        settings: &FetchConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            supervisor: StageSupervisor::new(STAGE_NAME, cancel, settings.shutdown_timeout),
            workers,
            input,
            output,
            fetcher,
            retry_wait: (settings.retry_wait_min, settings.retry_wait_max),
        }
    }

    /// Number of workers started by [`Stage::start`]
    pub fn workers(&self) -> usize {
        self.workers
    }
}

#[async_trait]
impl Stage for FetchProcessor {
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn start(&self) -> Result<()> {
        self.supervisor.start(self.workers, |worker, ctx| {
            let worker = Worker {
                id: worker,
                ctx,
                input: self.input.clone(),
                output: self.output.clone(),
                fetcher: self.fetcher.clone(),
                retry_wait: self.retry_wait,
            };
            worker.run()
        })
    }

    async fn lazy_shutdown(&self) -> Result<()> {
        self.supervisor.lazy_shutdown().await
    }

    async fn shutdown(&self) -> Result<()> {
        self.supervisor.shutdown().await
    }
}

struct Worker {
    id: usize,
    ctx: StageContext,
    input: Arc<TaskQueue>,
    output: Arc<TaskQueue>,
    fetcher: Fetcher,
    retry_wait: (Duration, Duration),
}

impl Worker {
    async fn run(self) {
        tracing::debug!(worker = self.id, "worker started");

        loop {
            if self.ctx.should_stop() {
                tracing::debug!(worker = self.id, "stop requested");
                break;
            }

            let task = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => break,
                _ = self.ctx.stop.cancelled() => break,
                task = self.input.pop() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let task = self.process(task).await;
            let id = task.id.clone();

            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    tracing::warn!(worker = self.id, task_id = %id, "task dropped on cancellation");
                    break;
                }
                pushed = self.output.push(task) => {
                    if let Err(e) = pushed {
                        tracing::error!(worker = self.id, task_id = %id, error = %e, "failed to forward task");
                    }
                }
            }
        }

        tracing::debug!(worker = self.id, "worker finished");
    }

    async fn process(&self, mut task: Task) -> Task {
        if !task.is_ready() {
            tracing::debug!(
                worker = self.id,
                task_id = %task.id,
                retries = task.state.retries,
                status = ?task.state.status,
                "forwarding task that is not ready"
            );
            return task;
        }

        task.begin_processing();

        let (min, max) = self.retry_wait;
        let request = FetchRequest::get(
            task.id.clone(),
            task.input.url.clone(),
            task.remaining_attempts(),
        )
        .with_retry_wait(min, max);

        let response = self.fetcher.get(&self.ctx.cancel, &request).await;

        match response.error() {
            Some(e) => tracing::warn!(
                worker = self.id,
                task_id = %task.id,
                status = response.status_code,
                error = %e,
                "fetch did not complete"
            ),
            None => tracing::info!(
                worker = self.id,
                task_id = %task.id,
                status = response.status_code,
                attempts = response.retries,
                "fetched"
            ),
        }

        task.finish(
            response.status_code,
            response.content,
            response.content_length,
            response.retries,
            response.outcome,
        );
        task
    }
}
