//! Error taxonomy of the task scheduler.

use crate::task::TaskIndex;
use crate::vars::VarsError;
use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced by the scheduler and `execute_task`
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    /// Unknown task index
    #[error("task not found: {0}")]
    TaskNotFound(TaskIndex),

    /// Unknown task type name
    #[error("task descriptor not found: {0}")]
    UnknownTaskName(String),

    /// A task may only be executed once
    #[error("task has already been executed: {0}")]
    AlreadyExecuted(TaskIndex),

    /// The `if` condition could not be evaluated
    #[error("task condition evaluation failed: {0}")]
    Condition(Arc<VarsError>),

    /// `load_config` failed
    #[error("failed loading task config: {0:#}")]
    Config(Arc<anyhow::Error>),

    /// The descriptor factory failed; no result is recorded for the task
    #[error("failed initializing task: {0:#}")]
    Construction(Arc<anyhow::Error>),

    /// The task finished with a failure result
    #[error("task {index} failed: {error:#}")]
    TaskFailed {
        index: TaskIndex,
        error: Arc<anyhow::Error>,
    },

    /// The per-task watchdog fired
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// A task panicked during execution
    #[error("task panicked: {0}")]
    Panic(String),

    /// The run was cancelled
    #[error("task run cancelled")]
    Cancelled,

    /// The overall run deadline passed
    #[error("task run timed out after {0:?}")]
    RunTimeout(Duration),
}

impl SchedulerError {
    /// Whether the error stems from a cancellation rather than a task failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SchedulerError::Cancelled | SchedulerError::RunTimeout(_))
    }
}
