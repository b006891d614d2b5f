//! Bounded, closable FIFO queue connecting pipeline stages.
//!
//! The queue is a thin wrapper around a tokio `mpsc` channel. Pushing blocks
//! while the buffer is full (backpressure), popping blocks while it is empty.
//! Closing drops the queue's sender so consumers see end-of-stream once the
//! buffered items have been drained.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::Task;

/// Buffer size of a pipeline queue: a producer blocks until a consumer is ready
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

/// Bounded FIFO of tasks shared by producers and consumers
pub struct TaskQueue {
    /// `None` once the queue is closed
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    /// Wakes producers blocked on a full buffer when the queue closes
    closed: CancellationToken,
    capacity: usize,
}

impl TaskQueue {
    /// Create a queue with the default capacity of one task
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a queue buffering up to `capacity` tasks (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            capacity,
        }
    }

    /// Maximum number of buffered tasks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Enqueue a task, waiting for buffer space
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] if the queue is closed before or while
    /// waiting. The task is dropped in that case.
    pub async fn push(&self, task: Task) -> Result<()> {
        let tx = self.sender().as_ref().cloned().ok_or(Error::QueueClosed)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::QueueClosed),
            sent = tx.send(task) => sent.map_err(|_| Error::QueueClosed),
        }
    }

    /// Dequeue the next task, waiting until one is available
    ///
    /// Returns `None` once the queue is closed and every buffered task has
    /// been taken. This is the only end-of-stream signal consumers get.
    pub async fn pop(&self) -> Option<Task> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Disallow further pushes; buffered tasks remain available to `pop`
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] if the queue was already closed.
    pub fn close(&self) -> Result<()> {
        let sender = self.sender().take();
        match sender {
            Some(_) => {
                self.closed.cancel();
                tracing::debug!("task queue closed");
                Ok(())
            }
            None => Err(Error::QueueClosed),
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<Task>>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
