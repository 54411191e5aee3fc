//! # Conductor
//!
//! A task scheduler for test orchestration. A test run is a tree of
//! cooperating tasks: root tasks run in order, composite tasks spawn and
//! run child tasks of their own, and cleanup tasks run afterwards no matter
//! how the main phase ended.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: scheduler, task state machine, result-change notification
//!   and persistence hook
//! - **[`tasks`]**: built-in task types (`sleep`, `run_tasks`,
//!   `run_tasks_concurrent`, `run_task_matrix`, `run_task_background`,
//!   `run_task_options`)
//! - **[`vars`]**: hierarchical variable scopes and a small jq-like query language
//! - **[`runner`]**: playbooks and test runs
//! - **[`cli`]**: argument parsing and configuration discovery
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conductor::runner::{Playbook, RunnerOptions, TestRunner};
//! use conductor::task::TaskRegistry;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let playbook = Playbook::from_yaml_str(
//!         "tasks:\n  - name: sleep\n    config:\n      duration: 1s\n",
//!     )?;
//!     let runner = TestRunner::new(
//!         playbook,
//!         Arc::new(TaskRegistry::builtin()),
//!         RunnerOptions::default(),
//!     )?;
//!
//!     let summary = runner.run(&CancellationToken::new()).await?;
//!     println!("run {} finished: {}", summary.run_id, summary.status);
//!     Ok(())
//! }
//! ```

/// Task scheduling core.
///
/// Owns task states, drives the per-task state machine and reports tasks
/// in pre-order, depth-first order.
pub mod task;

/// Built-in task types.
pub mod tasks;

/// Variable scopes and queries.
pub mod vars;

/// Playbooks and test runs.
pub mod runner;

/// Per-task log scopes.
pub mod logger;

/// Scheduler error taxonomy.
pub mod error;

/// Compact duration strings (`500ms`, `10s`, `5m`).
pub mod duration;

/// Environment constants and path utilities.
///
/// Centralizes all hardcoded paths and file names used throughout
/// the application for easier maintenance and consistency.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use error::SchedulerError;
pub use runner::{Playbook, RunStatus, RunnerOptions, TestRunSummary, TestRunner};
pub use task::{
    Task, TaskContext, TaskDescriptor, TaskIndex, TaskOptions, TaskRegistry, TaskResult,
    TaskScheduler, TaskState, TaskStatus,
};
pub use vars::Variables;
