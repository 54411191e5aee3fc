use crate::task::{Task, TaskContext, TaskDescriptor, TaskOptions, TaskResult};
use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TASK_NAME: &str = "run_task_background";

/// What happens when the background task stops before the foreground task
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundCompletePolicy {
    /// Keep waiting for the foreground task
    #[default]
    Ignore,
    /// Cancel the foreground task and fail
    Fail,
    /// Cancel the foreground task and succeed
    Succeed,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RunTaskBackgroundConfig {
    pub foreground_task: Option<TaskOptions>,
    pub background_task: Option<TaskOptions>,
    pub on_background_complete: BackgroundCompletePolicy,
    pub new_variable_scope: bool,
}

pub fn descriptor() -> TaskDescriptor {
    TaskDescriptor::new(
        TASK_NAME,
        "Runs a foreground task with a background task alongside.",
        super::config_value(&RunTaskBackgroundConfig::default()),
        |ctx, options| Ok(Box::new(RunTaskBackgroundTask::new(ctx, options)) as Box<dyn Task>),
    )
}

pub struct RunTaskBackgroundTask {
    ctx: TaskContext,
    options: TaskOptions,
    config: RunTaskBackgroundConfig,
}

impl RunTaskBackgroundTask {
    pub fn new(ctx: TaskContext, options: TaskOptions) -> Self {
        Self {
            ctx,
            options,
            config: RunTaskBackgroundConfig::default(),
        }
    }
}

#[derive(Clone, Copy)]
enum FirstStopped {
    Foreground,
    Background,
}

#[async_trait]
impl Task for RunTaskBackgroundTask {
    fn config(&self) -> Value {
        super::config_value(&self.config)
    }

    fn timeout(&self) -> Duration {
        self.options.timeout
    }

    fn load_config(&mut self) -> Result<()> {
        let config: RunTaskBackgroundConfig = super::load_task_config(&self.ctx, &self.options)?;
        if config.foreground_task.is_none() {
            bail!("missing foregroundTask");
        }
        self.config = config;
        Ok(())
    }

    async fn execute(&mut self, cancel: CancellationToken) -> Result<()> {
        let Some(foreground_options) = self.config.foreground_task.clone() else {
            bail!("missing foregroundTask");
        };
        let vars = self
            .config
            .new_variable_scope
            .then(|| self.ctx.vars().new_scope());

        let foreground = self.ctx.new_task(foreground_options, vars.clone()).await?;
        let background = match self.config.background_task.clone() {
            Some(options) => Some(self.ctx.new_task(options, vars).await?),
            None => None,
        };

        let foreground_cancel = cancel.child_token();
        let background_cancel = cancel.child_token();

        let mut background_handle = background.map(|index| {
            let ctx = self.ctx.clone();
            let token = background_cancel.clone();
            tokio::spawn(async move { ctx.execute_task(&token, index, None).await })
        });

        let foreground_run = self.ctx.execute_task(&foreground_cancel, foreground, None);
        tokio::pin!(foreground_run);

        let first = match background_handle.as_mut() {
            Some(handle) => tokio::select! {
                _ = &mut foreground_run => FirstStopped::Foreground,
                _ = handle => FirstStopped::Background,
            },
            None => {
                let _ = (&mut foreground_run).await;
                FirstStopped::Foreground
            }
        };

        let policy = self.config.on_background_complete;
        let result = match first {
            FirstStopped::Foreground => super::child_result(&self.ctx, foreground).await,
            FirstStopped::Background => {
                self.ctx
                    .logger()
                    .info(format!("background task stopped, policy: {policy:?}"));
                if policy != BackgroundCompletePolicy::Ignore {
                    foreground_cancel.cancel();
                }
                let _ = (&mut foreground_run).await;
                match policy {
                    BackgroundCompletePolicy::Ignore => super::child_result(&self.ctx, foreground).await,
                    BackgroundCompletePolicy::Fail => TaskResult::Failure,
                    BackgroundCompletePolicy::Succeed => TaskResult::Success,
                }
            }
        };

        background_cancel.cancel();
        if let Some(handle) = background_handle {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }

        match result {
            TaskResult::Failure => {
                self.ctx.set_result(TaskResult::Failure);
                match (first, policy) {
                    (FirstStopped::Background, BackgroundCompletePolicy::Fail) => {
                        bail!("background task stopped before foreground task")
                    }
                    _ => bail!("foreground task failed"),
                }
            }
            TaskResult::Success => {
                self.ctx.set_result(TaskResult::Success);
                Ok(())
            }
            TaskResult::None => Ok(()),
        }
    }
}
