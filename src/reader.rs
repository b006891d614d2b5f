//! Line reader stage: one task per input line.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::error::Result;
use crate::queue::TaskQueue;
use crate::stage::{Stage, StageContext, StageSupervisor};
use crate::types::Task;

const STAGE_NAME: &str = "reader";

/// Producer stage turning lines into tasks
///
/// Every line becomes a task, blank ones included, with the line as read
/// (minus its terminator) as the URL. The task ID is the 1-based line number.
pub struct LineReader<R> {
    supervisor: StageSupervisor,
    source: Mutex<Option<R>>,
    output: Arc<TaskQueue>,
    max_attempts: u32,
}

impl LineReader<BufReader<tokio::fs::File>> {
    /// Reader over the file at `path`
    pub async fn open(
        path: impl AsRef<Path>,
        output: Arc<TaskQueue>,
        settings: &FetchConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(BufReader::new(file), output, settings, cancel))
    }
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    /// Reader over any buffered source
    pub fn new(
        source: R,
        output: Arc<TaskQueue>,
        settings: &FetchConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            supervisor: StageSupervisor::new(STAGE_NAME, cancel, settings.shutdown_timeout),
            source: Mutex::new(Some(source)),
            output,
            max_attempts: settings.max_attempts,
        }
    }
}

#[async_trait]
impl<R> Stage for LineReader<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn name(&self) -> &'static str {
        STAGE_NAME
    }

    fn start(&self) -> Result<()> {
        let mut source = self
            .source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        self.supervisor.start(1, |_, ctx| {
            read_lines(source.take(), self.output.clone(), self.max_attempts, ctx)
        })
    }

    async fn lazy_shutdown(&self) -> Result<()> {
        self.supervisor.lazy_shutdown().await
    }

    async fn shutdown(&self) -> Result<()> {
        self.supervisor.shutdown().await
    }
}

async fn read_lines<R>(source: Option<R>, output: Arc<TaskQueue>, max_attempts: u32, ctx: StageContext)
where
    R: AsyncBufRead + Unpin,
{
    let Some(source) = source else {
        return;
    };

    let mut lines = source.lines();
    let mut line_number = 0usize;
    let mut pushed = 0usize;

    loop {
        if ctx.should_stop() {
            break;
        }

        let line = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ctx.stop.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(line = line_number + 1, error = %e, "failed to read input");
                break;
            }
        };
        line_number += 1;

        let task = Task::new(line_number, line, max_attempts);
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ctx.stop.cancelled() => break,
            result = output.push(task) => result,
        };

        if let Err(e) = result {
            tracing::warn!(line = line_number, error = %e, "input queue rejected task");
            break;
        }
        pushed += 1;
    }

    tracing::info!(lines = line_number, tasks = pushed, "input read completed");
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{TaskId, TaskStatus};
    use std::io::Cursor;
    use std::time::Duration;

    fn settings() -> FetchConfig {
        FetchConfig {
            shutdown_timeout: Duration::from_millis(200),
            ..FetchConfig::default()
        }
    }

    async fn collect(queue: &TaskQueue) -> Vec<Task> {
        let mut tasks = Vec::new();
        while let Some(task) = queue.pop().await {
            tasks.push(task);
        }
        tasks
    }

    #[tokio::test]
    async fn one_task_per_line_numbered_from_one() {
        let input = Cursor::new(b"http://a.example/\n\n  http://b.example/  \r\nhttp://c.example/".to_vec());
        let queue = Arc::new(TaskQueue::with_capacity(8));
        let reader = LineReader::new(input, queue.clone(), &settings(), CancellationToken::new());

        reader.start().unwrap();
        reader.lazy_shutdown().await.unwrap();
        queue.close().unwrap();

        let tasks = collect(&queue).await;
        let ids: Vec<_> = tasks.iter().map(|t| t.id.clone()).collect();
        let urls: Vec<_> = tasks.iter().map(|t| t.input.url.as_str()).collect();

        assert_eq!(
            ids,
            vec![TaskId::new("1"), TaskId::new("2"), TaskId::new("3"), TaskId::new("4")]
        );
        assert_eq!(
            urls,
            vec!["http://a.example/", "", "  http://b.example/  ", "http://c.example/"],
            "only the line terminator is stripped"
        );
        for task in &tasks {
            assert_eq!(task.state.retries, 0);
            assert_eq!(task.state.max_retries, 3);
            assert_eq!(task.state.status, TaskStatus::Initial);
        }
    }

    #[tokio::test]
    async fn budget_comes_from_settings() {
        let queue = Arc::new(TaskQueue::with_capacity(8));
        let settings = FetchConfig {
            max_attempts: 5,
            ..settings()
        };
        let reader = LineReader::new(
            Cursor::new(b"http://a.example/\n".to_vec()),
            queue.clone(),
            &settings,
            CancellationToken::new(),
        );

        reader.start().unwrap();
        reader.lazy_shutdown().await.unwrap();
        queue.close().unwrap();

        assert_eq!(collect(&queue).await[0].state.max_retries, 5);
    }

    #[tokio::test]
    async fn closed_queue_stops_reader() {
        let queue = Arc::new(TaskQueue::new());
        queue.close().unwrap();
        let reader = LineReader::new(
            Cursor::new(b"http://a.example/\nhttp://b.example/\n".to_vec()),
            queue.clone(),
            &settings(),
            CancellationToken::new(),
        );

        reader.start().unwrap();
        reader.lazy_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_unblocks_reader_waiting_on_full_queue() {
        let queue = Arc::new(TaskQueue::new());
        let reader = LineReader::new(
            Cursor::new(b"http://a.example/\nhttp://b.example/\nhttp://c.example/\n".to_vec()),
            queue.clone(),
            &settings(),
            CancellationToken::new(),
        );

        reader.start().unwrap();
        // Nobody pops: the reader blocks on the second push until asked to stop
        tokio::time::sleep(Duration::from_millis(20)).await;
        reader.shutdown().await.unwrap();

        queue.close().unwrap();
        assert_eq!(collect(&queue).await.len(), 1);
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let queue = Arc::new(TaskQueue::with_capacity(8));
        let reader = LineReader::new(
            Cursor::new(Vec::new()),
            queue,
            &settings(),
            CancellationToken::new(),
        );

        reader.start().unwrap();
        assert!(matches!(
            reader.start(),
            Err(Error::InvalidStageState { stage: "reader", .. })
        ));
        reader.lazy_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn open_reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        std::fs::write(&path, "http://a.example/\nhttp://b.example/\n").unwrap();

        let queue = Arc::new(TaskQueue::with_capacity(8));
        let reader = LineReader::open(&path, queue.clone(), &settings(), CancellationToken::new())
            .await
            .unwrap();

        reader.start().unwrap();
        reader.lazy_shutdown().await.unwrap();
        queue.close().unwrap();

        assert_eq!(collect(&queue).await.len(), 2);
    }

    #[tokio::test]
    async fn open_missing_file_is_io_error() {
        let queue = Arc::new(TaskQueue::new());
        let result = LineReader::open(
            "/definitely/not/here.txt",
            queue,
            &settings(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(Error::Io(_))));
    }
}
