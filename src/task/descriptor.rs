use crate::task::context::TaskContext;
use crate::task::types::TaskOptions;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A unit of work the scheduler can run.
///
/// Implementations should watch `cancel` and return promptly once it fires;
/// the scheduler cannot interrupt a task that ignores it.
#[async_trait]
pub trait Task: Send {
    /// Effective config after `load_config`
    fn config(&self) -> Value;

    /// Per-task timeout, zero for none
    fn timeout(&self) -> Duration;

    /// Parse and validate config; called once before `execute`
    fn load_config(&mut self) -> Result<()>;

    async fn execute(&mut self, cancel: CancellationToken) -> Result<()>;
}

/// Factory building a task instance for one occurrence
pub type TaskFactory = Arc<dyn Fn(TaskContext, TaskOptions) -> Result<Box<dyn Task>> + Send + Sync>;

/// A registered task type
#[derive(Clone)]
pub struct TaskDescriptor {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: String,
    /// Default config, shown by `list-tasks`
    pub config: Value,
    pub new_task: TaskFactory,
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl TaskDescriptor {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, config: Value, factory: F) -> Self
    where
        F: Fn(TaskContext, TaskOptions) -> Result<Box<dyn Task>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            description: description.into(),
            config,
            new_task: Arc::new(factory),
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn matches(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }
}

/// Static table of task types, built once at start-up.
///
/// Lookups match the name or an alias; on duplicates the first registration wins.
#[derive(Default, Debug, Clone)]
pub struct TaskRegistry {
    descriptors: Vec<Arc<TaskDescriptor>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding all built-in task types
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        crate::tasks::register_builtin(&mut registry);
        registry
    }

    pub fn register(&mut self, descriptor: TaskDescriptor) -> &mut Self {
        self.descriptors.push(Arc::new(descriptor));
        self
    }

    pub fn find(&self, name: &str) -> Option<Arc<TaskDescriptor>> {
        self.descriptors.iter().find(|d| d.matches(name)).cloned()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<TaskDescriptor>> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
