use crate::error::SchedulerError;
use crate::logger::TaskLogger;
use crate::task::execution::WatchFn;
use crate::task::scheduler::TaskScheduler;
use crate::task::state::TaskState;
use crate::task::types::{TaskIndex, TaskOptions, TaskResult};
use crate::vars::Variables;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Capabilities handed to a running task
#[derive(Clone)]
pub struct TaskContext {
    scheduler: Arc<TaskScheduler>,
    state: Arc<TaskState>,
    logger: TaskLogger,
}

impl TaskContext {
    pub(crate) fn new(scheduler: Arc<TaskScheduler>, state: Arc<TaskState>) -> Self {
        let logger = state.log_scope().logger();
        Self {
            scheduler,
            state,
            logger,
        }
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn index(&self) -> TaskIndex {
        self.state.index()
    }

    pub fn state(&self) -> &Arc<TaskState> {
        &self.state
    }

    /// Variable scope of this task
    pub fn vars(&self) -> &Variables {
        self.state.vars()
    }

    /// Output scope of this task
    pub fn outputs(&self) -> Variables {
        self.state.outputs()
    }

    pub fn logger(&self) -> &TaskLogger {
        &self.logger
    }

    /// Create a child task of this task.
    ///
    /// Without an explicit scope the child shares this task's scope. The
    /// child inherits the cleanup classification of this task.
    pub async fn new_task(
        &self,
        options: TaskOptions,
        vars: Option<Variables>,
    ) -> Result<TaskIndex, SchedulerError> {
        let vars = vars.unwrap_or_else(|| self.state.vars().clone());
        self.scheduler
            .new_task_state(options, Some(self.state.index()), vars, self.state.is_cleanup())
            .await
    }

    /// Explicitly set this task's result
    pub fn set_result(&self, result: TaskResult) {
        self.state.set_result(result, true);
    }

    /// Run a child task, see [`TaskScheduler::execute_task`]
    pub async fn execute_task(
        &self,
        cancel: &CancellationToken,
        index: TaskIndex,
        watch: Option<WatchFn>,
    ) -> Result<(), SchedulerError> {
        self.scheduler.execute_task(cancel, index, watch).await
    }
}
