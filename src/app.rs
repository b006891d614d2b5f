//! Application wiring: queues, stages and the controller for one run.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, FetchConfig};
use crate::controller::Controller;
use crate::error::Result;
use crate::fetcher::{Fetcher, JitteredBackoff, build_client};
use crate::processor::FetchProcessor;
use crate::queue::TaskQueue;
use crate::reader::LineReader;
use crate::writer::LineWriter;

/// A fully wired reader → processor → writer pipeline
pub struct Pipeline<W> {
    controller: Controller,
    sink: Arc<Mutex<W>>,
}

impl<W> Pipeline<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wire a pipeline reading URLs from `source` and writing records to `sink`
    ///
    /// Every stage observes `cancel`; cancelling it interrupts in-flight
    /// fetches and queue waits.
    pub fn new<R>(config: &Config, source: R, sink: W, cancel: CancellationToken) -> Result<Self>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        config.validate()?;

        let client = build_client(&config.http)?;
        let fetcher = fetcher_for(client, &config.fetch);

        let input = Arc::new(TaskQueue::new());
        let output = Arc::new(TaskQueue::new());

        let reader = LineReader::new(source, input.clone(), &config.fetch, cancel.clone());
        let processor = FetchProcessor::new(
            input.clone(),
            output.clone(),
            fetcher,
            config.app.workers,
            &config.fetch,
            cancel.clone(),
        );
        let writer = LineWriter::new(sink, output.clone(), &config.fetch, cancel);
        let sink = writer.sink();

        let controller = Controller::new(
            input,
            output,
            Arc::new(reader),
            Arc::new(processor),
            Arc::new(writer),
        );

        Ok(Self { controller, sink })
    }

    /// Run until every input line has been written out
    pub async fn run(&self) -> Result<()> {
        self.controller.run().await
    }

    /// Shared handle to the output sink
    pub fn sink(&self) -> Arc<Mutex<W>> {
        self.sink.clone()
    }
}

/// Fetch every URL in the file at `input`, writing records to stdout
///
/// SIGINT or SIGTERM cancels the run.
pub async fn run(config: &Config, input: impl AsRef<Path>) -> Result<()> {
    let input = input.as_ref();
    let started = std::time::Instant::now();

    let file = tokio::fs::File::open(input).await.inspect_err(|e| {
        tracing::error!(path = %input.display(), error = %e, "could not open input file");
    })?;

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));

    tracing::info!(path = %input.display(), workers = config.app.workers, "started");

    let result = match Pipeline::new(config, BufReader::new(file), tokio::io::stdout(), cancel) {
        Ok(pipeline) => pipeline.run().await,
        Err(e) => Err(e),
    };
    signals.abort();

    match &result {
        Ok(()) => tracing::info!(elapsed = ?started.elapsed(), "completed, time taken"),
        Err(e) => tracing::error!(elapsed = ?started.elapsed(), error = %e, "finished with errors"),
    }
    result
}

fn fetcher_for(client: reqwest::Client, settings: &FetchConfig) -> Fetcher {
    let fetcher = Fetcher::new(client);
    if settings.jitter {
        fetcher.with_backoff(JitteredBackoff)
    } else {
        fetcher
    }
}

async fn cancel_on_signal(cancel: CancellationToken) {
    wait_for_signal().await;
    cancel.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register signal handlers, using ctrl_c");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl_c");
                std::future::pending::<()>().await;
            }
            tracing::info!("received ctrl_c");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received ctrl_c"),
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for ctrl_c");
            std::future::pending::<()>().await;
        }
    }
}
