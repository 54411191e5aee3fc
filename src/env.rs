//! Environment constants and path utilities for the coordinator.
//!
//! This module centralizes all hardcoded paths, file names and environment
//! variable names used throughout the application.

use std::path::{Path, PathBuf};

/// Main application directory name (hidden directory like .git, .vscode)
pub const CONDUCTOR_DIR_NAME: &str = ".conductor";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up directly in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "conductor.toml";

/// System-wide configuration path (Unix-like systems)
pub const SYSTEM_CONFIG_PATH: &str = "/etc/conductor/config.toml";

/// Environment variable that overrides the log filter
pub const LOG_ENV_VAR: &str = "RUST_LOG";

/// Default tracing filter when neither config nor environment set one
pub const DEFAULT_LOG_FILTER: &str = "conductor=info";

/// State persistence file and directory names
pub mod state {
    /// Directory for task state snapshots, relative to the state root
    pub const TASKS_DIR_NAME: &str = "tasks";

    /// Extension of task snapshot files
    pub const SNAPSHOT_EXTENSION: &str = "json";

    /// Extension of task log files (JSON lines)
    pub const LOG_EXTENSION: &str = "log";

    /// Extension used for in-flight atomic writes
    pub const TEMP_EXTENSION: &str = "tmp";
}

/// Variable names published into task status scopes
pub mod vars {
    /// Sub-scope holding status scopes of tasks with an explicit id
    pub const TASKS_SCOPE: &str = "tasks";

    /// Sub-scope of a status scope holding task outputs
    pub const OUTPUTS_SCOPE: &str = "outputs";

    /// Variable holding the current run id
    pub const RUN_ID: &str = "runId";
}

/// Build the main .conductor directory path from a workspace root
pub fn conductor_dir_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(CONDUCTOR_DIR_NAME)
}

/// Build the local config file path (.conductor/config.toml)
pub fn local_config_file_path(workspace_root: &Path) -> PathBuf {
    conductor_dir_path(workspace_root).join(CONFIG_FILE_NAME)
}

/// Build the user config file path (~/.conductor/config.toml)
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    home_dir.join(CONDUCTOR_DIR_NAME).join(CONFIG_FILE_NAME)
}

/// Build the task snapshot directory from a state root
pub fn tasks_state_dir(state_root: &Path) -> PathBuf {
    state_root.join(state::TASKS_DIR_NAME)
}
