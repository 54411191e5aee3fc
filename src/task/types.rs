use crate::duration::serde_duration;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Unique, strictly increasing identity of a task occurrence (starts at 1)
pub type TaskIndex = u64;

/// Outcome of a task.
///
/// `None` is both the pending value and the final value of a skipped task.
/// Transitions are arbitrary writes; there is no enforced progression.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskResult {
    #[default]
    None,
    Success,
    Failure,
}

impl TaskResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskResult::None => "none",
            TaskResult::Success => "success",
            TaskResult::Failure => "failure",
        }
    }

    /// Whether the result is no longer pending
    pub fn is_decided(&self) -> bool {
        !matches!(self, TaskResult::None)
    }
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-authored configuration of one task occurrence
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    /// Task type name (or alias) looked up in the registry
    pub name: String,
    /// Raw task config, validated by the task's own `load_config`
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
    /// Config field name -> variable query
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_vars: BTreeMap<String, String>,
    /// Display title (template string)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Per-task timeout, zero means none
    #[serde(
        default,
        with = "serde_duration",
        skip_serializing_if = "Duration::is_zero"
    )]
    pub timeout: Duration,
    /// Stable id for result lookup through `.tasks.<id>`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Boolean condition query; the task is skipped when it is false
    #[serde(default, rename = "if", skip_serializing_if = "String::is_empty")]
    pub if_condition: String,
}

impl TaskOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_config_var(mut self, field: impl Into<String>, query: impl Into<String>) -> Self {
        self.config_vars.insert(field.into(), query.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_if(mut self, condition: impl Into<String>) -> Self {
        self.if_condition = condition.into();
        self
    }
}

/// Point-in-time snapshot of a task, used for reporting and persistence
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub index: TaskIndex,
    pub parent_index: Option<TaskIndex>,
    pub depth: u32,
    pub name: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub is_cleanup: bool,
    pub is_started: bool,
    pub is_running: bool,
    pub is_skipped: bool,
    pub is_timeout: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub result: TaskResult,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl TaskStatus {
    /// Wall-clock run time, if the task has started
    pub fn duration(&self) -> Option<ChronoDuration> {
        let start = self.start_time?;
        let stop = self.stop_time.unwrap_or_else(Utc::now);
        Some(stop.signed_duration_since(start))
    }
}
