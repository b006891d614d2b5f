//! Line writer stage: one result record per finished task, then a `DONE` sentinel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::error::Result;
use crate::queue::TaskQueue;
use crate::stage::{Stage, StageContext, StageSupervisor};
use crate::types::Task;

const STAGE_NAME: &str = "writer";

/// Separator written before every record and before the sentinel
pub const RECORD_SEPARATOR: &str = "---------------";

/// End-of-stream marker written once the writer has shut down
pub const DONE_SENTINEL: &str = "---------------\nDONE\n";

/// Render a task as its output record
///
/// An unknown content length is written as `-1`.
pub fn format_record(task: &Task) -> String {
    let content_length = task
        .output
        .content_length
        .map_or_else(|| "-1".to_string(), |len| len.to_string());

    format!(
        "{RECORD_SEPARATOR}\nCompleted url: {}, status: {}, contentlength: {}, content: {}\n",
        task.input.url, task.output.status_code, content_length, task.output.content
    )
}

/// Consumer stage writing result records to a sink
pub struct LineWriter<W> {
    supervisor: StageSupervisor,
    sink: Arc<Mutex<W>>,
    input: Arc<TaskQueue>,
    done_written: AtomicBool,
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Writer draining `input` into `sink`
    pub fn new(
        sink: W,
        input: Arc<TaskQueue>,
        settings: &FetchConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            supervisor: StageSupervisor::new(STAGE_NAME, cancel, settings.shutdown_timeout),
            sink: Arc::new(Mutex::new(sink)),
            input,
            done_written: AtomicBool::new(false),
        }
    }

    /// Shared handle to the sink
    pub fn sink(&self) -> Arc<Mutex<W>> {
        self.sink.clone()
    }

    async fn write_done(&self) {
        if self.done_written.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut sink = self.sink.lock().await;
        if let Err(e) = write_flushed(&mut *sink, DONE_SENTINEL).await {
            tracing::error!(error = %e, "failed to write end-of-stream marker");
        }
    }
}

#[async_trait]
impl<W> Stage for LineWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn start(&self) -> Result<()> {
        self.supervisor.start(1, |_, ctx| {
            write_records(self.input.clone(), self.sink.clone(), ctx)
        })
    }

    async fn lazy_shutdown(&self) -> Result<()> {
        let result = self.supervisor.lazy_shutdown().await;
        self.write_done().await;
        result
    }

    async fn shutdown(&self) -> Result<()> {
        let result = self.supervisor.shutdown().await;
        self.write_done().await;
        result
    }
}

async fn write_records<W>(input: Arc<TaskQueue>, sink: Arc<Mutex<W>>, ctx: StageContext)
where
    W: AsyncWrite + Unpin + Send,
{
    let mut written = 0usize;

    loop {
        if ctx.should_stop() {
            break;
        }

        let task = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ctx.stop.cancelled() => break,
            task = input.pop() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let record = format_record(&task);
        let mut sink = sink.lock().await;
        match write_flushed(&mut *sink, &record).await {
            Ok(()) => written += 1,
            Err(e) => tracing::error!(task_id = %task.id, error = %e, "failed to write record"),
        }
    }

    tracing::info!(records = written, "output write completed");
}

async fn write_flushed<W>(sink: &mut W, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(text.as_bytes()).await?;
    sink.flush().await
}
