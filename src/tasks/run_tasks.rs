use crate::task::{Task, TaskContext, TaskDescriptor, TaskOptions, TaskResult, watch_task_pass};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TASK_NAME: &str = "run_tasks";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RunTasksConfig {
    pub tasks: Vec<TaskOptions>,
    /// Cancel each child as soon as it decides its result
    pub stop_child_on_result: bool,
    /// Succeed only if a child fails
    pub expect_failure: bool,
    /// Keep running the remaining children after a failure
    pub continue_on_failure: bool,
    pub new_variable_scope: bool,
}

pub fn descriptor() -> TaskDescriptor {
    TaskDescriptor::new(
        TASK_NAME,
        "Runs a set of child tasks sequentially.",
        super::config_value(&RunTasksConfig::default()),
        |ctx, options| Ok(Box::new(RunTasksTask::new(ctx, options)) as Box<dyn Task>),
    )
    .with_aliases(&["run_tasks_sequential"])
}

pub struct RunTasksTask {
    ctx: TaskContext,
    options: TaskOptions,
    config: RunTasksConfig,
}

impl RunTasksTask {
    pub fn new(ctx: TaskContext, options: TaskOptions) -> Self {
        Self {
            ctx,
            options,
            config: RunTasksConfig::default(),
        }
    }
}

#[async_trait]
impl Task for RunTasksTask {
    fn config(&self) -> Value {
        super::config_value(&self.config)
    }

    fn timeout(&self) -> Duration {
        self.options.timeout
    }

    fn load_config(&mut self) -> Result<()> {
        self.config = super::load_task_config(&self.ctx, &self.options)?;
        Ok(())
    }

    async fn execute(&mut self, cancel: CancellationToken) -> Result<()> {
        let vars = self
            .config
            .new_variable_scope
            .then(|| self.ctx.vars().new_scope());

        // allocate every child up front so they all show up in reports
        let mut children = Vec::with_capacity(self.config.tasks.len());
        for options in &self.config.tasks {
            children.push(self.ctx.new_task(options.clone(), vars.clone()).await?);
        }

        let watch = self.config.stop_child_on_result.then(watch_task_pass);
        let mut failed = 0usize;

        for (position, child) in children.iter().copied().enumerate() {
            if cancel.is_cancelled() {
                bail!("interrupted before child task {}", position + 1);
            }

            let outcome = self.ctx.execute_task(&cancel, child, watch.clone()).await;
            let result = super::child_result(&self.ctx, child).await;
            if outcome.is_err() || result == TaskResult::Failure {
                failed += 1;
                let logger = self.ctx.logger().with_field("child", child);
                match &outcome {
                    Err(err) => logger.warn(format!("child task failed: {err}")),
                    Ok(()) => logger.warn("child task failed"),
                }
                if !self.config.continue_on_failure {
                    break;
                }
            }
        }

        self.ctx.outputs().set_var("failedTasks", failed);

        if self.config.expect_failure {
            if failed == 0 {
                self.ctx.set_result(TaskResult::Failure);
                return Err(anyhow!("expected a child task to fail, but all succeeded"));
            }
            self.ctx.set_result(TaskResult::Success);
            return Ok(());
        }

        if failed > 0 {
            bail!("{} child task(s) failed", failed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let config: RunTasksConfig = serde_json::from_value(json!({
            "tasks": [{"name": "sleep", "config": {"duration": "1ms"}}],
            "continueOnFailure": true,
        }))
        .unwrap();

        assert_eq!(config.tasks.len(), 1);
        assert_eq!(config.tasks[0].name, "sleep");
        assert!(config.continue_on_failure);
        assert!(!config.stop_child_on_result);
        assert!(!config.expect_failure);
    }
}
