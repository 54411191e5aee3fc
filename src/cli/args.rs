//! Command line argument parsing
//!
//! This module handles CLI argument parsing with subcommands:
//! - `run`: Execute a playbook
//! - `list-tasks`: List registered task types
//! - `show-config`: Show configuration discovery information

use crate::duration::parse_duration;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub enum ExecutionMode {
    Run(RunConfig),
    ListTasks,
    ShowConfig { config_override: Option<PathBuf> },
}

#[derive(Debug)]
pub struct RunConfig {
    pub playbook: PathBuf,
    pub config_override: Option<PathBuf>,
    pub timeout_override: Option<Duration>,
    pub state_dir_override: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, Parser)]
#[command(name = "conductor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Runs test playbooks as trees of cooperating tasks")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute a playbook (YAML or JSON)
    Run {
        /// Path to the playbook file
        playbook: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Deadline of the main phase, e.g. 30s or 10m
        #[arg(long = "timeout", value_parser = parse_duration)]
        timeout: Option<Duration>,
        /// Directory for task state snapshots and logs
        #[arg(long = "state-dir")]
        state_dir: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
    },
    /// List registered task types
    ListTasks,
    /// Show configuration discovery information
    ShowConfig {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                playbook,
                config,
                timeout,
                state_dir,
                verbose,
            }) => {
                Self::check_playbook_extension(playbook)?;
                Ok(ExecutionMode::Run(RunConfig {
                    playbook: playbook.clone(),
                    config_override: config.clone(),
                    timeout_override: *timeout,
                    state_dir_override: state_dir.clone(),
                    verbose: *verbose,
                }))
            }
            Some(Commands::ListTasks) => Ok(ExecutionMode::ListTasks),
            Some(Commands::ShowConfig { config }) => Ok(ExecutionMode::ShowConfig {
                config_override: config.clone(),
            }),
            None => Err(
                "No command specified. Use 'conductor --help' to see available commands."
                    .to_string(),
            ),
        }
    }

    /// Playbooks are YAML; JSON is accepted as a YAML subset.
    ///
    /// Note: Extension matching is case-insensitive
    fn check_playbook_extension(path: &Path) -> Result<(), String> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" | "json" => Ok(()),
            other => Err(format!(
                "Unsupported playbook file {:?} (extension '{}'), expected .yaml, .yml or .json",
                path, other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command() {
        let args = Args::try_parse_from([
            "conductor",
            "run",
            "smoke.yaml",
            "-c",
            "conductor.toml",
            "--timeout",
            "10m",
            "--state-dir",
            "/tmp/state",
            "-v",
        ])
        .unwrap();
        let mode = args.mode().unwrap();

        if let ExecutionMode::Run(config) = mode {
            assert_eq!(config.playbook, PathBuf::from("smoke.yaml"));
            assert_eq!(config.config_override, Some(PathBuf::from("conductor.toml")));
            assert_eq!(config.timeout_override, Some(Duration::from_secs(600)));
            assert_eq!(config.state_dir_override, Some(PathBuf::from("/tmp/state")));
            assert!(config.verbose);
        } else {
            panic!("Expected Run mode");
        }
    }

    #[test]
    fn test_invalid_timeout_is_rejected() {
        let result = Args::try_parse_from(["conductor", "run", "smoke.yaml", "--timeout", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_playbook_extension_detection() {
        assert!(Args::check_playbook_extension(Path::new("smoke.yaml")).is_ok());
        assert!(Args::check_playbook_extension(Path::new("/path/to/smoke.yml")).is_ok());
        assert!(Args::check_playbook_extension(Path::new("./plan.JSON")).is_ok());
        assert!(Args::check_playbook_extension(Path::new("tasks.md")).is_err());
        assert!(Args::check_playbook_extension(Path::new("playbook")).is_err());
    }

    #[test]
    fn test_other_commands() {
        let args = Args::try_parse_from(["conductor", "list-tasks"]).unwrap();
        assert!(matches!(args.mode().unwrap(), ExecutionMode::ListTasks));

        let args = Args::try_parse_from(["conductor", "show-config"]).unwrap();
        assert!(matches!(
            args.mode().unwrap(),
            ExecutionMode::ShowConfig { config_override: None }
        ));
    }

    #[test]
    fn test_no_command_error() {
        let args = Args { command: None };
        assert!(args.mode().is_err());
    }
}
