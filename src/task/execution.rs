//! `execute_task`: the lifecycle of one task occurrence.

use crate::error::SchedulerError;
use crate::task::context::TaskContext;
use crate::task::scheduler::TaskScheduler;
use crate::task::state::TaskState;
use crate::task::types::{TaskIndex, TaskResult};
use crate::vars::is_truthy;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Background policy spawned next to a task.
///
/// Receives the task's own cancellation token, which doubles as its cancel
/// function, and the index of the task being executed.
pub type WatchFn =
    Arc<dyn Fn(Arc<TaskScheduler>, CancellationToken, TaskIndex) -> BoxFuture<'static, ()> + Send + Sync>;

/// [`TaskScheduler::watch_task_pass`] as a [`WatchFn`]
pub fn watch_task_pass() -> WatchFn {
    Arc::new(|scheduler, cancel, index| scheduler.watch_task_pass(cancel, index).boxed())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<anyhow::Error>() {
        format!("{err:#}")
    } else {
        "unknown panic payload".to_string()
    }
}

impl TaskScheduler {
    /// Run a previously allocated task to completion.
    ///
    /// Blocks until the task, including timeout and cancellation unwinding,
    /// has stopped. Each task may be executed at most once. Panics inside the
    /// task are contained: the task's result becomes `Failure` and this
    /// returns `Ok(())`.
    pub async fn execute_task(
        self: &Arc<Self>,
        parent: &CancellationToken,
        index: TaskIndex,
        watch: Option<WatchFn>,
    ) -> Result<(), SchedulerError> {
        let state = self
            .get_task_state(index)
            .await
            .ok_or(SchedulerError::TaskNotFound(index))?;

        let title_template = if state.options().title.is_empty() {
            state.descriptor().name.clone()
        } else {
            state.options().title.clone()
        };
        let title = state.vars().resolve_placeholders(&title_template);
        if !state.mark_started(title) {
            return Err(SchedulerError::AlreadyExecuted(index));
        }
        self.persist_state(&state).await;

        let result = self.run_task(parent, &state, watch).await;

        state.mark_stopped();
        self.persist_state(&state).await;
        self.flush_logs(&state).await;

        result
    }

    async fn run_task(
        self: &Arc<Self>,
        parent: &CancellationToken,
        state: &Arc<TaskState>,
        watch: Option<WatchFn>,
    ) -> Result<(), SchedulerError> {
        let index = state.index();
        let logger = state.log_scope().logger();

        let condition = &state.options().if_condition;
        if !condition.is_empty() {
            let value = match state.vars().resolve_query(condition) {
                Ok((value, _)) => value,
                Err(err) => {
                    logger.error(format!("failed evaluating condition `{condition}`: {err}"));
                    let err = Arc::new(err);
                    state.set_error(Arc::new(anyhow::anyhow!("condition `{}`: {}", condition, err)));
                    state.set_result(TaskResult::Failure, false);
                    return Err(SchedulerError::Condition(err));
                }
            };
            let pass = match value {
                Value::Bool(pass) => pass,
                other => {
                    logger.warn(format!(
                        "condition `{condition}` returned non-boolean value {other}, using its truthiness"
                    ));
                    is_truthy(&other)
                }
            };
            if !pass {
                logger.info("skipping task, condition is false");
                state.mark_skipped();
                state.set_result(TaskResult::None, false);
                return Ok(());
            }
        }

        let ctx = TaskContext::new(self.clone(), state.clone());
        let factory = state.descriptor().new_task.clone();
        let options = state.options().clone();
        let mut task = match std::panic::catch_unwind(AssertUnwindSafe(|| factory(ctx, options))) {
            Ok(Ok(task)) => task,
            Ok(Err(err)) => return Err(SchedulerError::Construction(Arc::new(err))),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                return Err(SchedulerError::Construction(Arc::new(anyhow::anyhow!(
                    "task factory panicked: {message}"
                ))));
            }
        };

        if let Err(err) = task.load_config() {
            logger.error(format!("failed loading task config: {err:#}"));
            let err = Arc::new(err);
            state.set_error(err.clone());
            state.set_result(TaskResult::Failure, false);
            return Err(SchedulerError::Config(err));
        }
        state.set_config(task.config());

        let cancel = parent.child_token();
        let timeout = task.timeout();
        let mut watchdog = None;
        if !timeout.is_zero() {
            let token = cancel.clone();
            let timeout_state = state.clone();
            let timeout_logger = logger.clone();
            watchdog = Some(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        timeout_state.mark_timeout();
                        timeout_logger.warn(format!("task timed out after {timeout:?}"));
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            }));
        }

        if let Some(watch) = watch {
            tokio::spawn(watch(self.clone(), cancel.clone(), index));
        }

        info!("Executing task {}: {}", index, state.title());
        let outcome = AssertUnwindSafe(task.execute(cancel.clone()))
            .catch_unwind()
            .await;
        // stops the watchdog and any watcher
        cancel.cancel();
        if let Some(watchdog) = watchdog {
            // the timeout flag is final once the watchdog has exited
            if let Err(err) = watchdog.await {
                warn!("Timeout watchdog for task {} failed: {}", index, err);
            }
        }
        let timed_out = state.is_timeout();
        drop(task);

        let final_result = match outcome {
            Ok(exec_result) => {
                if let Err(err) = &exec_result {
                    logger.warn(format!("task returned error: {err:#}"));
                }
                state.finalize(exec_result.err(), timed_out, timeout)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                logger.error(format!("task panicked: {message}"));
                let result =
                    state.finalize_panic(anyhow::Error::new(SchedulerError::Panic(message)));
                debug!("Task {} finished with result {} after panic", index, result);
                // the failure is recorded on the task; the panic is not reported to the caller
                return Ok(());
            }
        };

        debug!("Task {} finished with result {}", index, final_result);
        if final_result == TaskResult::Failure {
            let error = state
                .error()
                .unwrap_or_else(|| Arc::new(anyhow::anyhow!("task result is failure")));
            return Err(SchedulerError::TaskFailed { index, error });
        }
        Ok(())
    }

    /// Cancel `cancel` as soon as the task's result is decided.
    ///
    /// Returns early if `cancel` fires first.
    pub async fn watch_task_pass(self: Arc<Self>, cancel: CancellationToken, index: TaskIndex) {
        let Some(state) = self.get_task_state(index).await else {
            return;
        };

        let mut last = TaskResult::None;
        loop {
            if let Some(update) = state.result_update(last) {
                tokio::select! {
                    _ = update.wait() => {}
                    _ = cancel.cancelled() => return,
                }
            }

            let current = state.result();
            if current != TaskResult::None {
                debug!("Task {} decided ({}), cancelling", index, current);
                cancel.cancel();
                return;
            }
            last = current;
        }
    }

    async fn persist_state(&self, state: &TaskState) {
        if let Err(err) = self.store().update_task_state(&state.status()).await {
            warn!("Failed to persist state of task {}: {:#}", state.index(), err);
        }
    }

    async fn flush_logs(&self, state: &TaskState) {
        let entries = state.log_scope().flush();
        if entries.is_empty() {
            return;
        }
        if let Err(err) = self.store().write_task_logs(state.index(), &entries).await {
            warn!("Failed to write logs of task {}: {:#}", state.index(), err);
        }
    }
}
