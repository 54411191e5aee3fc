//! Playbook definitions loaded from YAML.
//!
//! A playbook names the root and cleanup tasks of one test run:
//!
//! ```yaml
//! id: smoke
//! name: Smoke test
//! timeout: 5m
//! config:
//!   walletCount: 2
//! configVars:
//!   endpoint: ".globalEndpoint"
//! tasks:
//!   - name: sleep
//!     config:
//!       duration: 1s
//! cleanupTasks: []
//! ```

use crate::duration::serde_duration;
use crate::task::{TaskOptions, TaskRegistry};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Playbook {
    pub id: String,
    pub name: String,
    /// Deadline of the main phase, zero to use the configured default
    #[serde(with = "serde_duration", skip_serializing_if = "Duration::is_zero")]
    pub timeout: Duration,
    /// Initial variables of the run scope
    pub config: BTreeMap<String, Value>,
    /// Run variable name -> query against the global variables
    pub config_vars: BTreeMap<String, String>,
    pub tasks: Vec<TaskOptions>,
    pub cleanup_tasks: Vec<TaskOptions>,
}

impl Playbook {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("failed to parse playbook")
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read playbook {}", path.display()))?;
        let mut playbook = Self::from_yaml_str(&content)
            .with_context(|| format!("invalid playbook {}", path.display()))?;
        if playbook.id.is_empty() {
            playbook.id = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(playbook)
    }

    /// Check that the playbook has tasks and every task type is registered.
    ///
    /// Child tasks nested in task configs are only checked when they are created.
    pub fn validate(&self, registry: &TaskRegistry) -> Result<()> {
        if self.tasks.is_empty() {
            bail!("playbook '{}' has no tasks", self.display_name());
        }
        for task in self.tasks.iter().chain(self.cleanup_tasks.iter()) {
            if registry.find(&task.name).is_none() {
                bail!("unknown task '{}' in playbook '{}'", task.name, self.display_name());
            }
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PLAYBOOK: &str = r#"
id: smoke
name: Smoke test
timeout: 2m
config:
  walletCount: 2
configVars:
  endpoint: ".endpoints[0]"
tasks:
  - name: sleep
    title: "Wait ${walletCount}"
    timeout: 10s
    config:
      duration: 100ms
  - name: run_tasks
    id: nested
    if: ".walletCount > 1"
    config:
      tasks:
        - name: sleep
          config:
            duration: 1ms
cleanupTasks:
  - name: sleep
    config:
      duration: 1ms
"#;

    #[test]
    fn test_parse_playbook() {
        let playbook = Playbook::from_yaml_str(PLAYBOOK).unwrap();

        assert_eq!(playbook.id, "smoke");
        assert_eq!(playbook.display_name(), "Smoke test");
        assert_eq!(playbook.timeout, Duration::from_secs(120));
        assert_eq!(playbook.config["walletCount"], Value::from(2));
        assert_eq!(playbook.config_vars["endpoint"], ".endpoints[0]");
        assert_eq!(playbook.tasks.len(), 2);
        assert_eq!(playbook.cleanup_tasks.len(), 1);

        let first = &playbook.tasks[0];
        assert_eq!(first.title, "Wait ${walletCount}");
        assert_eq!(first.timeout, Duration::from_secs(10));
        assert_eq!(first.config["duration"], Value::from("100ms"));

        let second = &playbook.tasks[1];
        assert_eq!(second.id, "nested");
        assert_eq!(second.if_condition, ".walletCount > 1");
    }

    #[test]
    fn test_validate_playbook() {
        let registry = TaskRegistry::builtin();
        let playbook = Playbook::from_yaml_str(PLAYBOOK).unwrap();
        playbook.validate(&registry).unwrap();

        let unknown = Playbook::from_yaml_str("tasks:\n  - name: no_such_task\n").unwrap();
        assert!(unknown.validate(&registry).is_err());

        let empty = Playbook::from_yaml_str("name: empty\n").unwrap();
        assert!(empty.validate(&registry).is_err());
    }

    #[test]
    fn test_playbook_id_from_file_name() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nightly.yaml");
        fs::write(&path, "tasks:\n  - name: sleep\n").unwrap();

        let playbook = Playbook::from_yaml_file(&path).unwrap();
        assert_eq!(playbook.id, "nightly");
        assert_eq!(playbook.tasks[0].name, "sleep");
    }
}
