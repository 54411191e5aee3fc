//! Test run orchestration: one playbook, one scheduler, one summary.

pub mod playbook;

pub use playbook::Playbook;

use crate::env;
use crate::error::SchedulerError;
use crate::task::{
    NoopStateStore, SchedulerConfig, TaskRegistry, TaskResult, TaskScheduler, TaskStateStore,
    TaskStatus,
};
use crate::vars::Variables;
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Overall outcome of a test run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
    Cancelled,
    Timeout,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Report of a finished test run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunSummary {
    pub run_id: String,
    pub playbook_id: String,
    pub name: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    /// Main-phase tasks in reporting order
    pub tasks: Vec<TaskStatus>,
    /// Cleanup-phase tasks in reporting order
    pub cleanup_tasks: Vec<TaskStatus>,
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    pub not_run_count: usize,
}

impl TestRunSummary {
    pub fn duration(&self) -> chrono::Duration {
        self.stop_time - self.start_time
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Settings applied to every run
#[derive(Clone)]
pub struct RunnerOptions {
    /// Parent scope of the run scope
    pub global_vars: Variables,
    pub store: Arc<dyn TaskStateStore>,
    pub scheduler_config: SchedulerConfig,
    /// Main-phase deadline used when the playbook sets none
    pub default_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            global_vars: Variables::new(),
            store: Arc::new(NoopStateStore),
            scheduler_config: SchedulerConfig::default(),
            default_timeout: Duration::ZERO,
        }
    }
}

/// Runs one playbook on its own scheduler
pub struct TestRunner {
    run_id: String,
    playbook: Playbook,
    scheduler: Arc<TaskScheduler>,
    timeout: Duration,
    started: AtomicBool,
}

impl TestRunner {
    /// Validate the playbook and prepare the run scope.
    ///
    /// The run scope is a child of the global variables holding the run id,
    /// the playbook `config` values and the `configVars` copied from the
    /// global variables.
    pub fn new(playbook: Playbook, registry: Arc<TaskRegistry>, options: RunnerOptions) -> Result<Self> {
        playbook.validate(&registry)?;

        let run_id = Uuid::new_v4().to_string();
        let run_vars = options.global_vars.new_scope();
        run_vars.set_var(env::vars::RUN_ID, run_id.clone());
        for (name, value) in &playbook.config {
            run_vars.set_var(name.clone(), value.clone());
        }
        run_vars
            .copy_vars(&options.global_vars, &playbook.config_vars)
            .context("failed copying playbook config vars")?;

        let timeout = if playbook.timeout.is_zero() {
            options.default_timeout
        } else {
            playbook.timeout
        };

        let scheduler = TaskScheduler::new(registry, run_vars)
            .with_store(options.store)
            .with_config(options.scheduler_config);

        Ok(Self {
            run_id,
            playbook,
            scheduler: Arc::new(scheduler),
            timeout,
            started: AtomicBool::new(false),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn playbook(&self) -> &Playbook {
        &self.playbook
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Cancel the run; see [`TaskScheduler::cancel_tasks`]
    pub fn cancel(&self, cancel_cleanup: bool) {
        info!(
            "Cancelling test run {} (cleanup: {})",
            self.run_id, cancel_cleanup
        );
        self.scheduler.cancel_tasks(cancel_cleanup);
    }

    /// Run the playbook once; a second call is rejected
    pub async fn run(&self, cancel: &CancellationToken) -> Result<TestRunSummary> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("test run {} has already been started", self.run_id);
        }

        for options in &self.playbook.tasks {
            self.scheduler.add_root_task(options.clone()).await?;
        }
        for options in &self.playbook.cleanup_tasks {
            self.scheduler.add_cleanup_task(options.clone()).await?;
        }

        info!(
            "Starting test run {} ({}, {} tasks, {} cleanup tasks)",
            self.run_id,
            self.playbook.display_name(),
            self.playbook.tasks.len(),
            self.playbook.cleanup_tasks.len()
        );
        let start_time = Utc::now();
        let outcome = self.scheduler.run_tasks(cancel, self.timeout).await;
        let stop_time = Utc::now();

        let (status, error) = match &outcome {
            Ok(()) => (RunStatus::Success, None),
            Err(SchedulerError::Cancelled) => (RunStatus::Cancelled, Some(outcome_message(&outcome))),
            Err(SchedulerError::RunTimeout(_)) => (RunStatus::Timeout, Some(outcome_message(&outcome))),
            Err(_) => (RunStatus::Failure, Some(outcome_message(&outcome))),
        };
        if let Some(error) = &error {
            warn!("Test run {} finished with {}: {}", self.run_id, status, error);
        } else {
            info!("Test run {} finished successfully", self.run_id);
        }

        let tasks: Vec<TaskStatus> = self
            .scheduler
            .get_all_tasks()
            .await
            .iter()
            .map(|s| s.status())
            .collect();
        let cleanup_tasks: Vec<TaskStatus> = self
            .scheduler
            .get_all_cleanup_tasks()
            .await
            .iter()
            .map(|s| s.status())
            .collect();

        let success_count = tasks.iter().filter(|t| t.result == TaskResult::Success).count();
        let failure_count = tasks.iter().filter(|t| t.result == TaskResult::Failure).count();
        let skipped_count = tasks.iter().filter(|t| t.is_skipped).count();
        let not_run_count = tasks.iter().filter(|t| !t.is_started).count();

        Ok(TestRunSummary {
            run_id: self.run_id.clone(),
            playbook_id: self.playbook.id.clone(),
            name: self.playbook.display_name().to_string(),
            status,
            error,
            start_time,
            stop_time,
            tasks,
            cleanup_tasks,
            success_count,
            failure_count,
            skipped_count,
            not_run_count,
        })
    }
}

fn outcome_message(outcome: &Result<(), SchedulerError>) -> String {
    match outcome {
        Ok(()) => String::new(),
        Err(err) => err.to_string(),
    }
}
