//! Per-task log scopes.
//!
//! Every task gets a [`LogScope`]. The scope hands out [`TaskLogger`]s that
//! emit through `tracing` (tagged with the task index and name) and keep the
//! most recent entries in a bounded buffer. [`LogScope::flush`] drains that
//! buffer so the scheduler can hand it to the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Default number of buffered entries per task
pub const DEFAULT_BUFFER_SIZE: usize = 100;

/// Log level of a buffered entry
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// A buffered log line
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<(String, String)>,
}

struct ScopeInner {
    task_index: u64,
    task_name: String,
    capacity: usize,
    buffer: Mutex<VecDeque<LogEntry>>,
    dropped: Mutex<u64>,
}

/// Log scope owned by one task occurrence
#[derive(Clone)]
pub struct LogScope {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for LogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogScope")
            .field("task_index", &self.inner.task_index)
            .field("task_name", &self.inner.task_name)
            .finish()
    }
}

impl LogScope {
    pub fn new(task_index: u64, task_name: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                task_index,
                task_name: task_name.into(),
                capacity: capacity.max(1),
                buffer: Mutex::new(VecDeque::new()),
                dropped: Mutex::new(0),
            }),
        }
    }

    /// Structured logger bound to this scope
    pub fn logger(&self) -> TaskLogger {
        TaskLogger {
            scope: self.clone(),
            fields: Vec::new(),
        }
    }

    /// Number of entries evicted from the buffer since the last flush
    pub fn dropped(&self) -> u64 {
        *self.inner.dropped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain and return all buffered entries
    pub fn flush(&self) -> Vec<LogEntry> {
        let mut buffer = self
            .inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *self.inner.dropped.lock().unwrap_or_else(PoisonError::into_inner) = 0;
        buffer.drain(..).collect()
    }

    fn push(&self, entry: LogEntry) {
        let mut buffer = self
            .inner
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if buffer.len() >= self.inner.capacity {
            buffer.pop_front();
            *self.inner.dropped.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        }
        buffer.push_back(entry);
    }
}

/// Field logger handed to running tasks
#[derive(Clone, Debug)]
pub struct TaskLogger {
    scope: LogScope,
    fields: Vec<(String, String)>,
}

impl TaskLogger {
    /// Derive a logger that attaches an extra field to every entry
    pub fn with_field(&self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        let mut fields = self.fields.clone();
        fields.push((key.into(), value.to_string()));
        Self {
            scope: self.scope.clone(),
            fields,
        }
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(LogLevel::Debug, message.to_string());
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(LogLevel::Info, message.to_string());
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(LogLevel::Warn, message.to_string());
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(LogLevel::Error, message.to_string());
    }

    fn log(&self, level: LogLevel, message: String) {
        let inner = &self.scope.inner;
        let fields = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");

        match level {
            LogLevel::Debug => {
                debug!(task = inner.task_index, task_name = %inner.task_name, fields = %fields, "{}", message)
            }
            LogLevel::Info => {
                info!(task = inner.task_index, task_name = %inner.task_name, fields = %fields, "{}", message)
            }
            LogLevel::Warn => {
                warn!(task = inner.task_index, task_name = %inner.task_name, fields = %fields, "{}", message)
            }
            LogLevel::Error => {
                error!(task = inner.task_index, task_name = %inner.task_name, fields = %fields, "{}", message)
            }
        }

        self.scope.push(LogEntry {
            time: Utc::now(),
            level,
            message,
            fields: self.fields.clone(),
        });
    }
}
