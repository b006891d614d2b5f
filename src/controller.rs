//! Pipeline sequencing: start every stage, then drain them in data-flow order.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::queue::TaskQueue;
use crate::stage::Stage;

/// Drives reader → processor → writer through their lifecycles
pub struct Controller {
    input: Arc<TaskQueue>,
    output: Arc<TaskQueue>,
    reader: Arc<dyn Stage>,
    processor: Arc<dyn Stage>,
    writer: Arc<dyn Stage>,
}

impl Controller {
    /// `input` connects reader and processor, `output` processor and writer
    pub fn new(
        input: Arc<TaskQueue>,
        output: Arc<TaskQueue>,
        reader: Arc<dyn Stage>,
        processor: Arc<dyn Stage>,
        writer: Arc<dyn Stage>,
    ) -> Self {
        Self {
            input,
            output,
            reader,
            processor,
            writer,
        }
    }

    /// Start all stages and wait for the input to be fully processed
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        self.drain().await
    }

    /// Start reader, writer and processor, in that order
    ///
    /// If a stage fails to start, the stages already running are shut down
    /// before the error is returned.
    pub async fn start(&self) -> Result<()> {
        let order = [&self.reader, &self.writer, &self.processor];

        for (started, stage) in order.iter().enumerate() {
            if let Err(e) = stage.start() {
                tracing::error!(stage = stage.name(), error = %e, "failed to start stage");
                for running in order[..started].iter().rev() {
                    if let Err(rollback) = running.shutdown().await {
                        tracing::warn!(stage = running.name(), error = %rollback, "rollback shutdown failed");
                    }
                }
                return Err(e);
            }
        }

        tracing::info!("pipeline started");
        Ok(())
    }

    /// Wait for each stage to finish on its own, closing queues in between
    ///
    /// A failed step is logged and the sequence carries on, so both queues are
    /// always closed and the writer always finishes. The first error is returned.
    pub async fn drain(&self) -> Result<()> {
        let mut first_error = None;

        record(&mut first_error, self.reader.name(), self.reader.lazy_shutdown().await);
        record(&mut first_error, "input queue", self.input.close());
        record(&mut first_error, self.processor.name(), self.processor.lazy_shutdown().await);
        record(&mut first_error, "output queue", self.output.close());
        record(&mut first_error, self.writer.name(), self.writer.lazy_shutdown().await);

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("pipeline drained");
                Ok(())
            }
        }
    }
}

fn record(first_error: &mut Option<Error>, step: &'static str, result: Result<()>) {
    if let Err(e) = result {
        tracing::error!(step, error = %e, "pipeline shutdown step failed");
        first_error.get_or_insert(e);
    }
}
