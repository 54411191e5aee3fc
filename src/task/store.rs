//! Persistence hook for task state and task logs.
//!
//! The scheduler calls the store after every lifecycle change and when a
//! task's log scope is flushed. Store failures are logged, never fatal.

use crate::env;
use crate::logger::LogEntry;
use crate::task::types::{TaskIndex, TaskStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[async_trait]
pub trait TaskStateStore: Send + Sync {
    async fn update_task_state(&self, status: &TaskStatus) -> Result<()>;

    async fn write_task_logs(&self, index: TaskIndex, entries: &[LogEntry]) -> Result<()>;
}

/// Store that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStateStore;

#[async_trait]
impl TaskStateStore for NoopStateStore {
    async fn update_task_state(&self, _status: &TaskStatus) -> Result<()> {
        Ok(())
    }

    async fn write_task_logs(&self, _index: TaskIndex, _entries: &[LogEntry]) -> Result<()> {
        Ok(())
    }
}

/// Store writing one JSON snapshot and one JSON-lines log file per task.
///
/// Snapshots are written to a temp file and renamed into place so readers
/// never observe a partial file.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    tasks_dir: PathBuf,
}

impl FileStateStore {
    pub async fn new(state_root: &Path) -> Result<Self> {
        let tasks_dir = env::tasks_state_dir(state_root);
        async_fs::create_dir_all(&tasks_dir)
            .await
            .with_context(|| format!("failed to create state directory {:?}", tasks_dir))?;
        Ok(Self { tasks_dir })
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    pub fn snapshot_path(&self, index: TaskIndex) -> PathBuf {
        self.tasks_dir
            .join(format!("task_{index}.{}", env::state::SNAPSHOT_EXTENSION))
    }

    pub fn log_path(&self, index: TaskIndex) -> PathBuf {
        self.tasks_dir
            .join(format!("task_{index}.{}", env::state::LOG_EXTENSION))
    }

    /// Read back a snapshot written by this store
    pub async fn load_task_state(&self, index: TaskIndex) -> Result<TaskStatus> {
        let path = self.snapshot_path(index);
        let content = async_fs::read(&path)
            .await
            .with_context(|| format!("failed to read task snapshot {:?}", path))?;
        serde_json::from_slice(&content).context("failed to parse task snapshot")
    }
}

#[async_trait]
impl TaskStateStore for FileStateStore {
    async fn update_task_state(&self, status: &TaskStatus) -> Result<()> {
        let final_path = self.snapshot_path(status.index);
        let temp_path = final_path.with_extension(env::state::TEMP_EXTENSION);
        let data = serde_json::to_vec_pretty(status).context("failed to serialize task state")?;

        async_fs::write(&temp_path, &data)
            .await
            .with_context(|| format!("failed to write {:?}", temp_path))?;
        async_fs::rename(&temp_path, &final_path)
            .await
            .with_context(|| format!("failed to move snapshot into place at {:?}", final_path))?;

        debug!("Persisted state of task {} ({} bytes)", status.index, data.len());
        Ok(())
    }

    async fn write_task_logs(&self, index: TaskIndex, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry).context("failed to serialize log entry")?;
            buf.push(b'\n');
        }

        let path = self.log_path(index);
        let mut file = async_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open task log {:?}", path))?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LogScope;
    use crate::task::types::TaskResult;
    use tempfile::TempDir;

    fn sample_status(index: TaskIndex) -> TaskStatus {
        TaskStatus {
            index,
            parent_index: None,
            depth: 0,
            name: "sleep".to_string(),
            title: "sleep".to_string(),
            id: String::new(),
            is_cleanup: false,
            is_started: true,
            is_running: false,
            is_skipped: false,
            is_timeout: false,
            start_time: None,
            stop_time: None,
            result: TaskResult::Success,
            error: None,
            config: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path()).await.unwrap();

        store.update_task_state(&sample_status(3)).await.unwrap();
        let loaded = store.load_task_state(3).await.unwrap();
        assert_eq!(loaded.index, 3);
        assert_eq!(loaded.result, TaskResult::Success);
        assert!(!store.snapshot_path(3).with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_logs_are_appended() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path()).await.unwrap();
        let scope = LogScope::new(1, "sleep", 10);
        scope.logger().info("first");
        store.write_task_logs(1, &scope.flush()).await.unwrap();
        scope.logger().info("second");
        store.write_task_logs(1, &scope.flush()).await.unwrap();

        let content = std::fs::read_to_string(store.log_path(1)).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("second"));
    }
}
