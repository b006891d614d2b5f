//! # url-fetcher
//!
//! Concurrent URL fetcher built as a three-stage pipeline:
//!
//! ```text
//! LineReader ──► TaskQueue ──► FetchProcessor (N workers) ──► TaskQueue ──► LineWriter
//! ```
//!
//! - **Backpressure** - queues hold a single task, so a fast producer waits
//!   for a free consumer instead of buffering the whole input
//! - **Retries** - each fetch is a bounded sequence of attempts with a
//!   pluggable [`RetryPolicy`] and [`Backoff`]
//! - **Two-phase shutdown** - every [`Stage`] can drain lazily or be stopped
//!   within a timeout, and no worker outlives its stage
//!
//! ## Quick Start
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use url_fetcher::{Config, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let urls = std::io::Cursor::new(b"https://example.com/\n".to_vec());
//!     let pipeline = Pipeline::new(
//!         &Config::default(),
//!         urls,
//!         tokio::io::stdout(),
//!         CancellationToken::new(),
//!     )?;
//!
//!     pipeline.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Application wiring
pub mod app;
/// Configuration types
pub mod config;
/// Start and drain sequencing
pub mod controller;
/// Error types
pub mod error;
/// Retrying HTTP fetcher
pub mod fetcher;
/// Subscriber setup
pub mod logging;
/// Worker pool stage
pub mod processor;
/// Bounded task queue
pub mod queue;
/// Input stage
pub mod reader;
/// Stage lifecycle
pub mod stage;
/// Core types
pub mod types;
/// Output stage
pub mod writer;

pub use app::Pipeline;
pub use config::Config;
pub use controller::Controller;
pub use error::{Error, Result};
pub use fetcher::{
    Backoff, DefaultRetryPolicy, ExponentialBackoff, FetchRequest, FetchResponse, Fetcher,
    JitteredBackoff, RetryDecision, RetryPolicy,
};
pub use processor::FetchProcessor;
pub use queue::TaskQueue;
pub use reader::LineReader;
pub use stage::{Stage, StageState};
pub use types::{FetchOutcome, Task, TaskId, TaskStatus};
pub use writer::LineWriter;
