use super::fanout::{FanoutPolicy, run_children};
use crate::task::{Task, TaskContext, TaskDescriptor, TaskOptions, TaskResult};
use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TASK_NAME: &str = "run_tasks_concurrent";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RunTasksConcurrentConfig {
    pub tasks: Vec<TaskOptions>,
    /// Successes needed to succeed, 0 = all
    pub succeed_task_count: u64,
    /// Failures that fail the task, 0 = never fail early
    pub fail_task_count: u64,
    pub new_variable_scope: bool,
}

impl Default for RunTasksConcurrentConfig {
    fn default() -> Self {
        Self {
            tasks: Vec::new(),
            succeed_task_count: 0,
            fail_task_count: 1,
            new_variable_scope: false,
        }
    }
}

pub fn descriptor() -> TaskDescriptor {
    TaskDescriptor::new(
        TASK_NAME,
        "Runs a set of child tasks in parallel.",
        super::config_value(&RunTasksConcurrentConfig::default()),
        |ctx, options| Ok(Box::new(RunTasksConcurrentTask::new(ctx, options)) as Box<dyn Task>),
    )
}

pub struct RunTasksConcurrentTask {
    ctx: TaskContext,
    options: TaskOptions,
    config: RunTasksConcurrentConfig,
}

impl RunTasksConcurrentTask {
    pub fn new(ctx: TaskContext, options: TaskOptions) -> Self {
        Self {
            ctx,
            options,
            config: RunTasksConcurrentConfig::default(),
        }
    }
}

#[async_trait]
impl Task for RunTasksConcurrentTask {
    fn config(&self) -> Value {
        super::config_value(&self.config)
    }

    fn timeout(&self) -> Duration {
        self.options.timeout
    }

    fn load_config(&mut self) -> Result<()> {
        let config: RunTasksConcurrentConfig = super::load_task_config(&self.ctx, &self.options)?;
        if config.succeed_task_count > config.tasks.len() as u64 {
            bail!(
                "succeedTaskCount ({}) exceeds number of tasks ({})",
                config.succeed_task_count,
                config.tasks.len()
            );
        }
        self.config = config;
        Ok(())
    }

    async fn execute(&mut self, cancel: CancellationToken) -> Result<()> {
        let vars = self
            .config
            .new_variable_scope
            .then(|| self.ctx.vars().new_scope());

        let mut children = Vec::with_capacity(self.config.tasks.len());
        for options in &self.config.tasks {
            children.push(self.ctx.new_task(options.clone(), vars.clone()).await?);
        }

        let policy = FanoutPolicy {
            succeed_task_count: self.config.succeed_task_count,
            fail_task_count: self.config.fail_task_count,
            max_concurrent: 0,
        };
        let outcome = run_children(&self.ctx, &cancel, &children, policy).await;

        let outputs = self.ctx.outputs();
        outputs.set_var("successCount", outcome.successes);
        outputs.set_var("failureCount", outcome.failures);

        if outcome.cancelled {
            bail!("interrupted while running child tasks");
        }
        self.ctx.set_result(outcome.result);
        if outcome.result == TaskResult::Failure {
            bail!(
                "{} of {} child tasks failed, {} succeeded",
                outcome.failures,
                outcome.total,
                outcome.successes
            );
        }
        Ok(())
    }
}
