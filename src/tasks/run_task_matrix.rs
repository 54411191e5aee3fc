use super::fanout::{FanoutPolicy, run_children};
use crate::task::{Task, TaskContext, TaskDescriptor, TaskOptions, TaskResult};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TASK_NAME: &str = "run_task_matrix";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RunTaskMatrixConfig {
    /// Task run once per matrix value
    pub task: Option<TaskOptions>,
    /// Variable holding the matrix value in each child scope
    pub matrix_var: String,
    pub matrix_values: Vec<Value>,
    /// Query producing the matrix values, overrides `matrixValues`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub matrix_values_query: String,
    pub run_concurrent: bool,
    /// 0 = unbounded
    pub max_concurrent: usize,
    /// Successes needed to succeed, 0 = all
    pub succeed_task_count: u64,
    /// Failures that fail the task, 0 = never fail early
    pub fail_task_count: u64,
}

impl Default for RunTaskMatrixConfig {
    fn default() -> Self {
        Self {
            task: None,
            matrix_var: String::new(),
            matrix_values: Vec::new(),
            matrix_values_query: String::new(),
            run_concurrent: false,
            max_concurrent: 0,
            succeed_task_count: 0,
            fail_task_count: 1,
        }
    }
}

pub fn descriptor() -> TaskDescriptor {
    TaskDescriptor::new(
        TASK_NAME,
        "Runs a child task for each value of a matrix.",
        super::config_value(&RunTaskMatrixConfig::default()),
        |ctx, options| Ok(Box::new(RunTaskMatrixTask::new(ctx, options)) as Box<dyn Task>),
    )
}

pub struct RunTaskMatrixTask {
    ctx: TaskContext,
    options: TaskOptions,
    config: RunTaskMatrixConfig,
}

impl RunTaskMatrixTask {
    pub fn new(ctx: TaskContext, options: TaskOptions) -> Self {
        Self {
            ctx,
            options,
            config: RunTaskMatrixConfig::default(),
        }
    }
}

#[async_trait]
impl Task for RunTaskMatrixTask {
    fn config(&self) -> Value {
        super::config_value(&self.config)
    }

    fn timeout(&self) -> Duration {
        self.options.timeout
    }

    fn load_config(&mut self) -> Result<()> {
        let mut config: RunTaskMatrixConfig = super::load_task_config(&self.ctx, &self.options)?;
        if config.task.is_none() {
            bail!("missing child task");
        }
        if config.matrix_var.is_empty() {
            bail!("missing matrixVar");
        }

        if !config.matrix_values_query.is_empty() {
            let (value, _) = self
                .ctx
                .vars()
                .resolve_query(&config.matrix_values_query)
                .context("failed evaluating matrixValuesQuery")?;
            config.matrix_values = match value {
                Value::Array(values) => values,
                Value::Null => Vec::new(),
                other => bail!("matrixValuesQuery returned {other}, expected an array"),
            };
        }

        self.config = config;
        Ok(())
    }

    async fn execute(&mut self, cancel: CancellationToken) -> Result<()> {
        let Some(template) = self.config.task.clone() else {
            bail!("missing child task");
        };

        let mut children = Vec::with_capacity(self.config.matrix_values.len());
        for value in &self.config.matrix_values {
            let scope = self.ctx.vars().new_scope();
            scope.set_var(self.config.matrix_var.clone(), value.clone());
            children.push(self.ctx.new_task(template.clone(), Some(scope)).await?);
        }
        self.ctx
            .logger()
            .info(format!("running {} matrix tasks", children.len()));

        let max_concurrent = if self.config.run_concurrent {
            self.config.max_concurrent
        } else {
            1
        };
        let policy = FanoutPolicy {
            succeed_task_count: self.config.succeed_task_count,
            fail_task_count: self.config.fail_task_count,
            max_concurrent,
        };
        let outcome = run_children(&self.ctx, &cancel, &children, policy).await;

        let outputs = self.ctx.outputs();
        outputs.set_var("successCount", outcome.successes);
        outputs.set_var("failureCount", outcome.failures);

        if outcome.cancelled {
            bail!("interrupted while running matrix tasks");
        }
        self.ctx.set_result(outcome.result);
        if outcome.result == TaskResult::Failure {
            bail!(
                "{} of {} matrix tasks failed, {} succeeded",
                outcome.failures,
                outcome.total,
                outcome.successes
            );
        }
        Ok(())
    }
}
