use crate::duration::{format_duration, serde_duration};
use crate::task::{Task, TaskContext, TaskDescriptor, TaskOptions};
use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TASK_NAME: &str = "sleep";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SleepConfig {
    #[serde(with = "serde_duration")]
    pub duration: Duration,
}

pub fn descriptor() -> TaskDescriptor {
    TaskDescriptor::new(
        TASK_NAME,
        "Sleeps for a specified duration.",
        super::config_value(&SleepConfig::default()),
        |ctx, options| Ok(Box::new(SleepTask::new(ctx, options)) as Box<dyn Task>),
    )
}

pub struct SleepTask {
    ctx: TaskContext,
    options: TaskOptions,
    config: SleepConfig,
}

impl SleepTask {
    pub fn new(ctx: TaskContext, options: TaskOptions) -> Self {
        Self {
            ctx,
            options,
            config: SleepConfig::default(),
        }
    }
}

#[async_trait]
impl Task for SleepTask {
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
        let duration = self.config.duration;
        self.ctx
            .logger()
            .info(format!("sleeping for {}", format_duration(duration)));

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.cancelled() => bail!("sleep interrupted"),
        }
    }
}
