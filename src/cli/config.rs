//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./conductor.toml or ./.conductor/config.toml
//! 2. User config: ~/.conductor/config.toml
//! 3. System config: /etc/conductor/config.toml
//! 4. Built-in defaults

use crate::duration::serde_duration;
use crate::env;
use crate::logger::DEFAULT_BUFFER_SIZE;
use crate::task::SchedulerConfig;
use crate::vars::Variables;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RunnerSection {
    /// Main-phase deadline for playbooks without their own timeout
    #[serde(with = "serde_duration")]
    pub default_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    /// Tracing filter, e.g. `info` or `conductor=debug`
    pub level: String,
    /// Log entries buffered per task between flushes
    pub buffer_size: usize,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: env::DEFAULT_LOG_FILTER.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct PersistenceSection {
    /// Directory for task snapshots and logs; nothing is persisted when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

/// Coordinator configuration file (`conductor.toml`)
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub runner: RunnerSection,
    pub logging: LoggingSection,
    pub persistence: PersistenceSection,
    /// Initial values of the global variable scope
    pub global_vars: BTreeMap<String, Value>,
}

impl CoordinatorConfig {
    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("failed to write config {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            log_buffer_size: self.logging.buffer_size,
        }
    }

    /// Root variable scope seeded from `[global_vars]`
    pub fn global_vars(&self) -> Variables {
        let vars = Variables::new();
        for (name, value) in &self.global_vars {
            vars.set_var(name.clone(), value.clone());
        }
        vars
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Load an explicit config file, or fall back to discovery
    pub fn load(explicit: Option<&Path>) -> Result<CoordinatorConfig> {
        match explicit {
            Some(path) => {
                info!("Loading configuration override from: {:?}", path);
                CoordinatorConfig::from_toml_file(path)
            }
            None => Self::discover_config(),
        }
    }

    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<CoordinatorConfig> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return CoordinatorConfig::from_toml_file(config_path);
        }

        info!("No configuration file found, using defaults");
        Ok(CoordinatorConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::get_config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Get list of configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        // 1. Current directory: ./conductor.toml, ./.conductor/config.toml
        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        // 2. User config: ~/.conductor/config.toml
        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        // 3. System config
        #[cfg(unix)]
        candidates.push(PathBuf::from(env::SYSTEM_CONFIG_PATH));

        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };

            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        if let Some(found) = Self::find_config_file() {
            println!("Active configuration: {:?}", found);
        } else {
            println!("Active configuration: Built-in defaults");
        }
    }
}
