use crate::task::{Task, TaskContext, TaskDescriptor, TaskOptions, TaskResult};
use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TASK_NAME: &str = "run_task_options";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RunTaskOptionsConfig {
    pub task: Option<TaskOptions>,
    /// Report a failing child as success
    pub ignore_failure: bool,
    /// Swap success and failure of the child
    pub invert_result: bool,
    pub new_variable_scope: bool,
}

impl RunTaskOptionsConfig {
    /// Rewrite a child result; applied as invert, then ignore
    pub fn apply(&self, result: TaskResult) -> TaskResult {
        let result = match (self.invert_result, result) {
            (true, TaskResult::Success) => TaskResult::Failure,
            (true, TaskResult::Failure) => TaskResult::Success,
            (_, other) => other,
        };
        if self.ignore_failure && result == TaskResult::Failure {
            return TaskResult::Success;
        }
        result
    }
}

pub fn descriptor() -> TaskDescriptor {
    TaskDescriptor::new(
        TASK_NAME,
        "Runs a child task and rewrites its result.",
        super::config_value(&RunTaskOptionsConfig::default()),
        |ctx, options| Ok(Box::new(RunTaskOptionsTask::new(ctx, options)) as Box<dyn Task>),
    )
}

pub struct RunTaskOptionsTask {
    ctx: TaskContext,
    options: TaskOptions,
    config: RunTaskOptionsConfig,
}

impl RunTaskOptionsTask {
    pub fn new(ctx: TaskContext, options: TaskOptions) -> Self {
        Self {
            ctx,
            options,
            config: RunTaskOptionsConfig::default(),
        }
    }
}

#[async_trait]
impl Task for RunTaskOptionsTask {
    fn config(&self) -> Value {
        super::config_value(&self.config)
    }

    fn timeout(&self) -> Duration {
        self.options.timeout
    }

    fn load_config(&mut self) -> Result<()> {
        let config: RunTaskOptionsConfig = super::load_task_config(&self.ctx, &self.options)?;
        if config.task.is_none() {
            bail!("missing child task");
        }
        self.config = config;
        Ok(())
    }

    async fn execute(&mut self, cancel: CancellationToken) -> Result<()> {
        let Some(child_options) = self.config.task.clone() else {
            bail!("missing child task");
        };
        let vars = self
            .config
            .new_variable_scope
            .then(|| self.ctx.vars().new_scope());

        let child = self.ctx.new_task(child_options, vars).await?;
        let outcome = self.ctx.execute_task(&cancel, child, None).await;

        let mut child_result = super::child_result(&self.ctx, child).await;
        if let Err(err) = &outcome {
            self.ctx.logger().warn(format!("child task failed: {err}"));
            // construction errors leave the child result unset
            if child_result == TaskResult::None {
                child_result = TaskResult::Failure;
            }
        }

        match self.config.apply(child_result) {
            TaskResult::Success => {
                self.ctx.set_result(TaskResult::Success);
                Ok(())
            }
            TaskResult::Failure => {
                self.ctx.set_result(TaskResult::Failure);
                bail!("child task result: {}", child_result)
            }
            TaskResult::None => Ok(()),
        }
    }
}
