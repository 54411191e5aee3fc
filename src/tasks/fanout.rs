//! Shared fan-out/fan-in loop for composite tasks.
//!
//! Children are started in order, bounded by a semaphore. Results are tallied
//! live through each child's result-update handle, so a child that decides
//! its result early can end the fan-out before it finishes.

use crate::task::{TaskContext, TaskIndex, TaskResult, TaskState};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Limits deciding the outcome of a fan-out
#[derive(Debug, Clone, Copy)]
pub struct FanoutPolicy {
    /// Successes needed for overall success, 0 = all children
    pub succeed_task_count: u64,
    /// Failures that make the fan-out fail, 0 = never fail early
    pub fail_task_count: u64,
    /// Children running at once, 0 = unbounded
    pub max_concurrent: usize,
}

/// Tally of a finished fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutOutcome {
    pub result: TaskResult,
    pub successes: u64,
    pub failures: u64,
    pub total: u64,
    pub cancelled: bool,
}

impl FanoutPolicy {
    fn decide(&self, successes: u64, failures: u64, total: u64, all_done: bool) -> Option<TaskResult> {
        if self.fail_task_count > 0 && failures >= self.fail_task_count {
            return Some(TaskResult::Failure);
        }
        let needed = if self.succeed_task_count == 0 {
            total
        } else {
            self.succeed_task_count
        };
        if successes >= needed {
            return Some(TaskResult::Success);
        }
        if all_done {
            // neither limit reached: fail closed
            return Some(TaskResult::Failure);
        }
        None
    }
}

async fn forward_result_changes(
    state: Arc<TaskState>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<TaskIndex>,
) {
    let mut last = TaskResult::None;
    loop {
        if let Some(update) = state.result_update(last) {
            tokio::select! {
                _ = update.wait() => {}
                _ = cancel.cancelled() => return,
            }
        }
        last = state.result();
        if tx.send(state.index()).is_err() {
            return;
        }
    }
}

/// Run `children` under `policy`; returns once every started child has stopped.
pub async fn run_children(
    ctx: &TaskContext,
    cancel: &CancellationToken,
    children: &[TaskIndex],
    policy: FanoutPolicy,
) -> FanoutOutcome {
    let total = children.len() as u64;
    let limit = if policy.max_concurrent == 0 {
        children.len().max(1)
    } else {
        policy.max_concurrent
    };
    let semaphore = Arc::new(Semaphore::new(limit));
    let children_cancel = cancel.child_token();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut states = Vec::with_capacity(children.len());
    let mut queue = children.iter().copied().peekable();
    let mut running = JoinSet::new();
    let mut finished = 0u64;
    let mut cancelled = false;

    let decided = loop {
        while queue.peek().is_some() {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                break;
            };
            let Some(index) = queue.next() else {
                break;
            };
            if let Some(state) = ctx.scheduler().get_task_state(index).await {
                tokio::spawn(forward_result_changes(
                    state.clone(),
                    children_cancel.clone(),
                    tx.clone(),
                ));
                states.push(state);
            }
            let child_ctx = ctx.clone();
            let token = children_cancel.clone();
            running.spawn(async move {
                let _permit = permit;
                if let Err(err) = child_ctx.execute_task(&token, index, None).await {
                    debug!("Child task {} ended with error: {}", index, err);
                }
                index
            });
        }

        let successes = states
            .iter()
            .filter(|s| s.result() == TaskResult::Success)
            .count() as u64;
        let failures = states
            .iter()
            .filter(|s| s.result() == TaskResult::Failure)
            .count() as u64;
        let all_done = queue.peek().is_none() && running.is_empty();
        if let Some(result) = policy.decide(successes, failures, total, all_done) {
            break result;
        }

        tokio::select! {
            Some(joined) = running.join_next() => {
                finished += 1;
                if let Err(err) = joined {
                    debug!("Child task runner aborted: {}", err);
                }
            }
            Some(_) = rx.recv() => {}
            _ = cancel.cancelled() => {
                cancelled = true;
                break TaskResult::Failure;
            }
        }
    };

    children_cancel.cancel();
    while running.join_next().await.is_some() {
        finished += 1;
    }
    debug!("Fan-out finished {} of {} children", finished, total);

    let successes = states
        .iter()
        .filter(|s| s.result() == TaskResult::Success)
        .count() as u64;
    let failures = states
        .iter()
        .filter(|s| s.result() == TaskResult::Failure)
        .count() as u64;

    FanoutOutcome {
        result: decided,
        successes,
        failures,
        total,
        cancelled,
    }
}
