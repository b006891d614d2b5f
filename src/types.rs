//! Core types for url-fetcher

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a task, assigned by the producer
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<usize> for TaskId {
    fn from(line_number: usize) -> Self {
        Self(line_number.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task lifecycle status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created by the producer, not yet picked up
    #[default]
    Initial,
    /// A worker owns the task and is fetching it
    Processing,
    /// Fetched with a 2xx response
    Completed,
    /// Fetched without a 2xx response (or not fetched at all)
    Error,
}

impl TaskStatus {
    /// Terminal tasks must never be fetched again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    /// Status a task moves to once a fetch has finished
    ///
    /// `Completed` only when an HTTP response ended the fetch and its status is
    /// 2xx. Every other outcome, including a terminal 4xx/5xx response, is `Error`.
    pub fn after_fetch(outcome: &FetchOutcome, status_code: u16) -> Self {
        match outcome {
            FetchOutcome::Response if (200..300).contains(&status_code) => TaskStatus::Completed,
            _ => TaskStatus::Error,
        }
    }
}

/// How a fetch ended, carried on the task so consumers can report it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchOutcome {
    /// The retry policy accepted an HTTP response (any status code)
    Response,
    /// A non-retryable failure ended the fetch
    Failed {
        /// Why the fetch failed
        reason: String,
    },
    /// Every allowed attempt asked for another retry
    Exhausted,
    /// The cancellation token fired before the fetch finished
    Cancelled,
}

impl std::fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchOutcome::Response => f.write_str("response"),
            FetchOutcome::Failed { reason } => write!(f, "failed: {reason}"),
            FetchOutcome::Exhausted => f.write_str("exhausted"),
            FetchOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Retry bookkeeping and status of a task
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    /// Attempts consumed so far
    pub retries: u32,
    /// Attempt budget, fixed at creation
    pub max_retries: u32,
    /// Lifecycle status
    pub status: TaskStatus,
}

/// What to fetch
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    /// The URL to GET
    pub url: String,
}

/// What the fetch produced
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// HTTP status code (0 if no response was ever received)
    pub status_code: u16,
    /// First bytes of the response body, lossily decoded
    pub content: String,
    /// Length declared by the response, if any
    pub content_length: Option<u64>,
    /// When the worker started fetching
    pub started_at: Option<DateTime<Utc>>,
    /// When the fetch returned
    pub completed_at: Option<DateTime<Utc>>,
    /// How the fetch ended (`None` until fetched)
    pub outcome: Option<FetchOutcome>,
}

/// The unit of work flowing through the pipeline
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Producer-assigned identifier
    pub id: TaskId,
    /// Fetch input
    pub input: TaskInput,
    /// Fetch output
    pub output: TaskOutput,
    /// Retry bookkeeping and status
    pub state: TaskState,
}

impl Task {
    /// Create a fresh task with no attempts consumed
    pub fn new(id: impl Into<TaskId>, url: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: id.into(),
            input: TaskInput { url: url.into() },
            output: TaskOutput::default(),
            state: TaskState {
                retries: 0,
                max_retries,
                status: TaskStatus::Initial,
            },
        }
    }

    /// Attempts left in the budget
    pub fn remaining_attempts(&self) -> u32 {
        self.state.max_retries.saturating_sub(self.state.retries)
    }

    /// Whether the task may be fetched
    ///
    /// False once the task is terminal or its attempt budget is spent.
    pub fn is_ready(&self) -> bool {
        !self.state.status.is_terminal() && self.state.retries < self.state.max_retries
    }

    /// Mark the task as owned by a worker
    pub fn begin_processing(&mut self) {
        self.state.status = TaskStatus::Processing;
        self.output.started_at = Some(Utc::now());
    }

    /// Record the result of a fetch and move to a terminal status
    ///
    /// `attempts` is added to the attempts already consumed, clamped to the
    /// budget so `retries` never exceeds `max_retries`.
    pub fn finish(
        &mut self,
        status_code: u16,
        content: String,
        content_length: Option<u64>,
        attempts: u32,
        outcome: FetchOutcome,
    ) {
        self.output.completed_at = Some(Utc::now());
        self.output.status_code = status_code;
        self.output.content = content;
        self.output.content_length = content_length;
        self.state.retries = self
            .state
            .retries
            .saturating_add(attempts)
            .min(self.state.max_retries);
        self.state.status = TaskStatus::after_fetch(&outcome, status_code);
        self.output.outcome = Some(outcome);
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_ready() {
        let task = Task::new(1usize, "http://ok.example/", 3);

        assert_eq!(task.id, TaskId::new("1"));
        assert_eq!(task.state.status, TaskStatus::Initial);
        assert_eq!(task.state.retries, 0);
        assert!(task.is_ready());
    }

    #[test]
    fn exhausted_budget_is_not_ready() {
        let mut task = Task::new("1", "http://ok.example/", 3);
        task.state.retries = 3;
        assert!(!task.is_ready());

        task.state.retries = 4;
        assert!(!task.is_ready(), "over budget must never be ready");

        let zero_budget = Task::new("2", "http://ok.example/", 0);
        assert!(!zero_budget.is_ready());
    }

    #[test]
    fn terminal_status_is_not_ready() {
        for status in [TaskStatus::Completed, TaskStatus::Error] {
            let mut task = Task::new("1", "http://ok.example/", 3);
            task.state.status = status;
            assert!(!task.is_ready(), "{status:?} task must not be ready");
        }

        let mut processing = Task::new("1", "http://ok.example/", 3);
        processing.state.status = TaskStatus::Processing;
        assert!(processing.is_ready());
    }

    #[test]
    fn after_fetch_completes_only_on_2xx_response() {
        assert_eq!(
            TaskStatus::after_fetch(&FetchOutcome::Response, 200),
            TaskStatus::Completed
        );
        assert_eq!(
            TaskStatus::after_fetch(&FetchOutcome::Response, 204),
            TaskStatus::Completed
        );
        assert_eq!(
            TaskStatus::after_fetch(&FetchOutcome::Response, 404),
            TaskStatus::Error
        );
        assert_eq!(
            TaskStatus::after_fetch(&FetchOutcome::Exhausted, 200),
            TaskStatus::Error,
            "exhaustion is never a completion"
        );
        assert_eq!(
            TaskStatus::after_fetch(&FetchOutcome::Cancelled, 0),
            TaskStatus::Error
        );
    }

    #[test]
    fn finish_records_output_and_clamps_retries() {
        let mut task = Task::new("1", "http://ok.example/", 3);
        task.begin_processing();
        assert_eq!(task.state.status, TaskStatus::Processing);
        assert!(task.output.started_at.is_some());

        task.finish(200, "hi".to_string(), Some(2), 5, FetchOutcome::Response);

        assert_eq!(task.output.status_code, 200);
        assert_eq!(task.output.content, "hi");
        assert_eq!(task.output.content_length, Some(2));
        assert_eq!(task.state.retries, 3, "retries must not exceed the budget");
        assert_eq!(task.state.status, TaskStatus::Completed);
        assert_eq!(task.output.outcome, Some(FetchOutcome::Response));
        assert!(task.output.completed_at.is_some());
        assert!(!task.is_ready());
    }

    #[test]
    fn finish_adds_to_consumed_attempts() {
        let mut task = Task::new("1", "http://ok.example/", 3);
        task.state.retries = 1;
        assert_eq!(task.remaining_attempts(), 2);

        task.finish(503, String::new(), None, 2, FetchOutcome::Exhausted);

        assert_eq!(task.state.retries, 3);
        assert_eq!(task.remaining_attempts(), 0);
        assert_eq!(task.state.status, TaskStatus::Error);
    }

    #[test]
    fn outcome_serializes_tagged() {
        let json = serde_json::to_value(FetchOutcome::Failed {
            reason: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["kind"], "failed");
        assert_eq!(json["reason"], "boom");

        let status = serde_json::to_value(TaskStatus::Completed).unwrap();
        assert_eq!(status, "completed");
    }
}
