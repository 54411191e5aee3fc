//! CLI-specific functionality for the coordinator
//!
//! This module contains all CLI-related code including argument parsing
//! and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, ExecutionMode, RunConfig};
pub use config::{ConfigDiscovery, CoordinatorConfig};
