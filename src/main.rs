use anyhow::{Context, Result};
use conductor::cli::{Args, ConfigDiscovery, CoordinatorConfig, ExecutionMode, RunConfig};
use conductor::duration::format_duration;
use conductor::env;
use conductor::runner::{Playbook, RunnerOptions, TestRunSummary, TestRunner};
use conductor::task::{FileStateStore, NoopStateStore, TaskRegistry, TaskResult, TaskStateStore};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match mode {
        ExecutionMode::Run(config) => run_playbook(config).await,
        ExecutionMode::ListTasks => {
            list_tasks();
            Ok(true)
        }
        ExecutionMode::ShowConfig { config_override } => show_config(config_override.as_deref()),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins over `-v`, which wins over the config file
fn init_logging(config: &CoordinatorConfig, verbose: bool) {
    let filter = EnvFilter::try_from_env(env::LOG_ENV_VAR).unwrap_or_else(|_| {
        let level = if verbose {
            "conductor=debug"
        } else {
            config.logging.level.as_str()
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(env::DEFAULT_LOG_FILTER))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_playbook(run: RunConfig) -> Result<bool> {
    let config = ConfigDiscovery::load(run.config_override.as_deref())?;
    init_logging(&config, run.verbose);

    let playbook = Playbook::from_yaml_file(&run.playbook)?;
    info!("Loaded playbook {:?} from {:?}", playbook.display_name(), run.playbook);

    let state_dir = run
        .state_dir_override
        .clone()
        .or_else(|| config.persistence.state_dir.clone());
    let store: Arc<dyn TaskStateStore> = match &state_dir {
        Some(dir) => Arc::new(
            FileStateStore::new(dir)
                .await
                .with_context(|| format!("failed to prepare state directory {:?}", dir))?,
        ),
        None => Arc::new(NoopStateStore),
    };

    let options = RunnerOptions {
        global_vars: config.global_vars(),
        store,
        scheduler_config: config.scheduler_config(),
        default_timeout: config.runner.default_timeout,
    };
    let mut playbook = playbook;
    if let Some(timeout) = run.timeout_override {
        playbook.timeout = timeout;
    }

    let runner = Arc::new(TestRunner::new(
        playbook,
        Arc::new(TaskRegistry::builtin()),
        options,
    )?);
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_interrupts(runner.clone(), shutdown.clone()));

    let summary = runner.run(&CancellationToken::new()).await?;
    shutdown.cancel();

    print_summary(&summary, run.verbose);
    Ok(summary.is_success())
}

/// First Ctrl-C cancels the main phase, the second one cleanup as well
async fn watch_interrupts(runner: Arc<TestRunner>, shutdown: CancellationToken) {
    let mut interrupts = 0;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
                interrupts += 1;
                if interrupts == 1 {
                    warn!("Interrupted, cancelling test run (press Ctrl-C again to skip cleanup)");
                    runner.cancel(false);
                } else {
                    warn!("Interrupted again, cancelling cleanup");
                    runner.cancel(true);
                    return;
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

fn print_summary(summary: &TestRunSummary, verbose: bool) {
    let icon = if summary.is_success() { "✅" } else { "❌" };
    let elapsed = summary.duration().to_std().unwrap_or_default();
    println!();
    println!(
        "{} {} ({}) finished with status {} in {}",
        icon,
        summary.name,
        summary.run_id,
        summary.status,
        format_duration(elapsed)
    );
    if let Some(error) = &summary.error {
        println!("   Error: {}", error);
    }
    println!(
        "   Tasks: {} succeeded, {} failed, {} skipped, {} not run",
        summary.success_count, summary.failure_count, summary.skipped_count, summary.not_run_count
    );

    let print_task = |task: &conductor::task::TaskStatus| {
        let marker = match (task.is_started, task.is_skipped, task.result) {
            (false, _, _) => "·",
            (_, true, _) => "↷",
            (_, _, TaskResult::Success) => "✓",
            (_, _, TaskResult::Failure) => "✗",
            (_, _, TaskResult::None) => "?",
        };
        println!(
            "   {}{} [{}] {}",
            "  ".repeat(task.depth as usize),
            marker,
            task.index,
            task.title
        );
        if verbose {
            if let Some(error) = &task.error {
                println!("   {}    {}", "  ".repeat(task.depth as usize), error);
            }
        }
    };

    println!();
    for task in &summary.tasks {
        print_task(task);
    }
    if !summary.cleanup_tasks.is_empty() {
        println!("   Cleanup:");
        for task in &summary.cleanup_tasks {
            print_task(task);
        }
    }
}

fn list_tasks() {
    let registry = TaskRegistry::builtin();
    println!("Available tasks:");
    for descriptor in registry.descriptors() {
        println!();
        if descriptor.aliases.is_empty() {
            println!("  {}", descriptor.name);
        } else {
            println!("  {} (aliases: {})", descriptor.name, descriptor.aliases.join(", "));
        }
        println!("    {}", descriptor.description);
        if let Ok(config) = serde_json::to_string(&descriptor.config) {
            println!("    default config: {}", config);
        }
    }
}

fn show_config(config_override: Option<&std::path::Path>) -> Result<bool> {
    ConfigDiscovery::show_discovery_info();
    let config = ConfigDiscovery::load(config_override)?;
    let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
    println!();
    println!("Effective configuration:");
    println!("{}", rendered);
    Ok(true)
}
