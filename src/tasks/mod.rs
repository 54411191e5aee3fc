//! Built-in task types.
//!
//! - `sleep`: wait for a duration
//! - `run_tasks`: run child tasks one after another
//! - `run_tasks_concurrent`: run child tasks in parallel with success/failure limits
//! - `run_task_matrix`: run one task per matrix value
//! - `run_task_background`: run a task with a background companion
//! - `run_task_options`: run a task and rewrite its result

pub mod fanout;
pub mod run_task_background;
pub mod run_task_matrix;
pub mod run_task_options;
pub mod run_tasks;
pub mod run_tasks_concurrent;
pub mod sleep;

use crate::task::{TaskContext, TaskIndex, TaskOptions, TaskRegistry, TaskResult};
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Register all built-in task types
pub fn register_builtin(registry: &mut TaskRegistry) {
    registry
        .register(sleep::descriptor())
        .register(run_tasks::descriptor())
        .register(run_tasks_concurrent::descriptor())
        .register(run_task_matrix::descriptor())
        .register(run_task_background::descriptor())
        .register(run_task_options::descriptor());
}

/// Build a task config from its defaults, the raw options config and `configVars`
pub(crate) fn load_task_config<T>(ctx: &TaskContext, options: &TaskOptions) -> Result<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    let mut config: T = match &options.config {
        Value::Null => T::default(),
        raw => serde_json::from_value(raw.clone())
            .with_context(|| format!("invalid config for task '{}'", options.name))?,
    };
    ctx.vars()
        .consume_vars(&mut config, &options.config_vars)
        .context("failed applying config vars")?;
    Ok(config)
}

pub(crate) fn config_value<T: Serialize>(config: &T) -> Value {
    serde_json::to_value(config).unwrap_or(Value::Null)
}

/// Final result of a child task; unknown children count as failed
pub(crate) async fn child_result(ctx: &TaskContext, index: TaskIndex) -> TaskResult {
    match ctx.scheduler().get_task_state(index).await {
        Some(state) => state.result(),
        None => TaskResult::Failure,
    }
}
