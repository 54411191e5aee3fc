//! Runtime record of one task occurrence and its result-change notifier.

use crate::env;
use crate::error::SchedulerError;
use crate::logger::LogScope;
use crate::task::descriptor::TaskDescriptor;
use crate::task::types::{TaskIndex, TaskOptions, TaskResult, TaskStatus};
use crate::vars::Variables;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct Lifecycle {
    is_started: bool,
    is_running: bool,
    is_skipped: bool,
    is_timeout: bool,
    start_time: Option<DateTime<Utc>>,
    stop_time: Option<DateTime<Utc>>,
    title: String,
    config: Value,
}

#[derive(Debug, Default)]
struct ResultSlot {
    result: TaskResult,
    error: Option<Arc<anyhow::Error>>,
    updated_by_task: bool,
    notify: Option<watch::Sender<()>>,
}

/// One-shot handle released when the task result changes.
///
/// All handles obtained for the same pending result share one channel and
/// are released together.
#[derive(Debug)]
pub struct ResultUpdate {
    rx: watch::Receiver<()>,
}

impl ResultUpdate {
    /// Wait until the result differs from the value the handle was taken for
    pub async fn wait(mut self) {
        // The sender is never used to send; it is dropped on change, which
        // completes `changed()` with an error.
        let _ = self.rx.changed().await;
    }
}

/// Runtime state of a task occurrence.
///
/// Owned by the scheduler's state table; parents are referenced by index.
/// The task instance itself only lives for the duration of `execute_task`.
#[derive(Debug)]
pub struct TaskState {
    index: TaskIndex,
    options: TaskOptions,
    descriptor: Arc<TaskDescriptor>,
    parent: Option<TaskIndex>,
    depth: u32,
    is_cleanup: bool,
    vars: Variables,
    status_vars: Variables,
    log: LogScope,
    lifecycle: Mutex<Lifecycle>,
    result: Mutex<ResultSlot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: TaskIndex,
        options: TaskOptions,
        descriptor: Arc<TaskDescriptor>,
        parent: Option<TaskIndex>,
        depth: u32,
        is_cleanup: bool,
        vars: Variables,
        log_buffer_size: usize,
    ) -> Self {
        let status_vars = Variables::new();
        status_vars.set_var("index", index);
        status_vars.set_var("result", TaskResult::None.as_str());
        status_vars.set_var("started", false);
        status_vars.set_var("running", false);
        status_vars.set_var("skipped", false);
        status_vars.set_var("timeout", false);
        status_vars.new_sub_scope(env::vars::OUTPUTS_SCOPE);

        let log = LogScope::new(index, descriptor.name.clone(), log_buffer_size);

        Self {
            index,
            options,
            descriptor,
            parent,
            depth,
            is_cleanup,
            vars,
            status_vars,
            log,
            lifecycle: Mutex::new(Lifecycle::default()),
            result: Mutex::new(ResultSlot::default()),
        }
    }

    pub fn index(&self) -> TaskIndex {
        self.index
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }

    pub fn descriptor(&self) -> &Arc<TaskDescriptor> {
        &self.descriptor
    }

    pub fn parent_index(&self) -> Option<TaskIndex> {
        self.parent
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_cleanup(&self) -> bool {
        self.is_cleanup
    }

    /// Variable scope the task runs in
    pub fn vars(&self) -> &Variables {
        &self.vars
    }

    /// Status scope published under `.tasks.<id>` for tasks with an id
    pub fn status_vars(&self) -> &Variables {
        &self.status_vars
    }

    /// Output scope written by the task
    pub fn outputs(&self) -> Variables {
        self.status_vars.get_sub_scope(env::vars::OUTPUTS_SCOPE)
    }

    pub fn log_scope(&self) -> &LogScope {
        &self.log
    }

    pub fn title(&self) -> String {
        let lifecycle = lock(&self.lifecycle);
        if lifecycle.title.is_empty() {
            self.descriptor.name.clone()
        } else {
            lifecycle.title.clone()
        }
    }

    pub fn is_started(&self) -> bool {
        lock(&self.lifecycle).is_started
    }

    pub fn is_running(&self) -> bool {
        lock(&self.lifecycle).is_running
    }

    pub fn is_skipped(&self) -> bool {
        lock(&self.lifecycle).is_skipped
    }

    pub fn is_timeout(&self) -> bool {
        lock(&self.lifecycle).is_timeout
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        lock(&self.lifecycle).start_time
    }

    pub fn stop_time(&self) -> Option<DateTime<Utc>> {
        lock(&self.lifecycle).stop_time
    }

    /// Config snapshot taken after `load_config`
    pub fn config(&self) -> Value {
        lock(&self.lifecycle).config.clone()
    }

    pub fn result(&self) -> TaskResult {
        lock(&self.result).result
    }

    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        lock(&self.result).error.clone()
    }

    /// Flip `is_started` (and `is_running`); false if it was already set
    pub(crate) fn mark_started(&self, title: String) -> bool {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.is_started {
                return false;
            }
            lifecycle.is_started = true;
            lifecycle.is_running = true;
            lifecycle.start_time = Some(Utc::now());
            lifecycle.title = title;
        }
        self.status_vars.set_var("started", true);
        self.status_vars.set_var("running", true);
        true
    }

    pub(crate) fn mark_stopped(&self) {
        {
            let mut lifecycle = lock(&self.lifecycle);
            lifecycle.is_running = false;
            lifecycle.stop_time = Some(Utc::now());
        }
        self.status_vars.set_var("running", false);
    }

    pub(crate) fn mark_skipped(&self) {
        lock(&self.lifecycle).is_skipped = true;
        self.status_vars.set_var("skipped", true);
    }

    pub(crate) fn mark_timeout(&self) {
        lock(&self.lifecycle).is_timeout = true;
        self.status_vars.set_var("timeout", true);
    }

    pub(crate) fn set_config(&self, config: Value) {
        lock(&self.lifecycle).config = config;
    }

    pub(crate) fn set_error(&self, error: Arc<anyhow::Error>) {
        lock(&self.result).error = Some(error);
    }

    /// Write a new result and wake every waiter on the previous one.
    ///
    /// Writing the current value again is a no-op and wakes nobody.
    pub fn set_result(&self, result: TaskResult, updated_by_task: bool) {
        let mut slot = lock(&self.result);
        if updated_by_task {
            slot.updated_by_task = true;
        }
        self.apply_result(&mut slot, result);
    }

    fn apply_result(&self, slot: &mut ResultSlot, result: TaskResult) -> bool {
        if slot.result == result {
            return false;
        }
        slot.result = result;
        self.status_vars.set_var("result", result.as_str());
        // dropping the sender releases all receivers at once
        drop(slot.notify.take());
        true
    }

    /// Handle that completes once the result differs from `old`.
    ///
    /// Returns `None` when the result already differs, so the caller re-reads
    /// instead of waiting on a change that has already happened.
    pub fn result_update(&self, old: TaskResult) -> Option<ResultUpdate> {
        let mut slot = lock(&self.result);
        if slot.result != old {
            return None;
        }
        let sender = slot.notify.get_or_insert_with(|| watch::channel(()).0);
        Some(ResultUpdate {
            rx: sender.subscribe(),
        })
    }

    /// Derive the final result once `execute` has returned.
    ///
    /// Runs under the result lock, so every `set_result` that completed
    /// before `execute` returned is taken into account. An explicit
    /// non-`None` result set by the task is kept; its execute error is then
    /// recorded only if that result is `Failure`.
    pub(crate) fn finalize(
        &self,
        exec_error: Option<anyhow::Error>,
        timed_out: bool,
        timeout: Duration,
    ) -> TaskResult {
        let mut slot = lock(&self.result);
        let explicit = slot.updated_by_task && slot.result.is_decided();

        if explicit {
            if slot.result == TaskResult::Failure && slot.error.is_none() {
                slot.error = exec_error.map(Arc::new);
            }
            return slot.result;
        }

        let failed = timed_out || exec_error.is_some();
        if let Some(err) = exec_error {
            slot.error = Some(Arc::new(err));
        } else if timed_out {
            slot.error = Some(Arc::new(anyhow::Error::new(SchedulerError::Timeout(timeout))));
        }

        let result = if failed {
            TaskResult::Failure
        } else {
            TaskResult::Success
        };
        self.apply_result(&mut slot, result);
        slot.result
    }

    /// Record a recovered panic: the error is stored and the result forced to `Failure`
    pub(crate) fn finalize_panic(&self, error: anyhow::Error) -> TaskResult {
        let mut slot = lock(&self.result);
        slot.error = Some(Arc::new(error));
        self.apply_result(&mut slot, TaskResult::Failure);
        slot.result
    }

    pub fn status(&self) -> TaskStatus {
        let (result, error) = {
            let slot = lock(&self.result);
            (slot.result, slot.error.as_ref().map(|e| format!("{e:#}")))
        };
        let lifecycle = lock(&self.lifecycle);
        TaskStatus {
            index: self.index,
            parent_index: self.parent,
            depth: self.depth,
            name: self.descriptor.name.clone(),
            title: if lifecycle.title.is_empty() {
                self.descriptor.name.clone()
            } else {
                lifecycle.title.clone()
            },
            id: self.options.id.clone(),
            is_cleanup: self.is_cleanup,
            is_started: lifecycle.is_started,
            is_running: lifecycle.is_running,
            is_skipped: lifecycle.is_skipped,
            is_timeout: lifecycle.is_timeout,
            start_time: lifecycle.start_time,
            stop_time: lifecycle.stop_time,
            result,
            error,
            config: lifecycle.config.clone(),
        }
    }
}
