use crate::error::SchedulerError;
use crate::env;
use crate::logger::DEFAULT_BUFFER_SIZE;
use crate::task::descriptor::TaskRegistry;
use crate::task::state::TaskState;
use crate::task::store::{NoopStateStore, TaskStateStore};
use crate::task::types::{TaskIndex, TaskOptions, TaskStatus};
use crate::vars::Variables;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of log entries buffered per task between flushes
    pub log_buffer_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            log_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Default)]
struct TaskTable {
    states: HashMap<TaskIndex, Arc<TaskState>>,
    root_tasks: Vec<TaskIndex>,
    all_tasks: Vec<TaskIndex>,
    root_cleanup_tasks: Vec<TaskIndex>,
    all_cleanup_tasks: Vec<TaskIndex>,
}

impl TaskTable {
    fn link(&self, index: TaskIndex) -> (Option<TaskIndex>, u32) {
        self.states
            .get(&index)
            .map_or((None, 0), |s| (s.parent_index(), s.depth()))
    }

    /// Pre-order, depth-first comparison of two tasks of the spawn forest.
    ///
    /// Both ancestor chains are lifted to the same depth; if they meet, the
    /// ancestor sorts first. Otherwise both are lifted in lock-step until
    /// they share a parent and the sibling indices decide.
    fn compare_task_order(&self, a: TaskIndex, b: TaskIndex) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }

        let (mut x, mut y) = (a, b);
        let (mut x_link, mut y_link) = (self.link(x), self.link(y));

        while x_link.1 > y_link.1 {
            match x_link.0 {
                Some(parent) => {
                    x = parent;
                    x_link = self.link(x);
                }
                None => break,
            }
        }
        while y_link.1 > x_link.1 {
            match y_link.0 {
                Some(parent) => {
                    y = parent;
                    y_link = self.link(y);
                }
                None => break,
            }
        }

        if x == y {
            // one task is an ancestor of the other
            return self.link(a).1.cmp(&self.link(b).1);
        }

        while x_link.0 != y_link.0 {
            match (x_link.0, y_link.0) {
                (Some(px), Some(py)) => {
                    x = px;
                    y = py;
                    x_link = self.link(x);
                    y_link = self.link(y);
                }
                _ => break,
            }
        }

        x.cmp(&y)
    }

    fn sort_task_list(&self, list: &mut [TaskIndex]) {
        list.sort_by(|a, b| self.compare_task_order(*a, *b));
    }

    fn collect(&self, list: &[TaskIndex]) -> Vec<Arc<TaskState>> {
        list.iter()
            .filter_map(|i| self.states.get(i).cloned())
            .collect()
    }
}

#[derive(Default)]
struct RunControl {
    main: Option<CancellationToken>,
    cleanup: Option<CancellationToken>,
    cancel_main: bool,
    cancel_cleanup: bool,
}

/// Owns every task state, the task index counter and the top-level run.
pub struct TaskScheduler {
    registry: Arc<TaskRegistry>,
    root_vars: Variables,
    store: Arc<dyn TaskStateStore>,
    config: SchedulerConfig,
    next_index: AtomicU64,
    table: RwLock<TaskTable>,
    run: Mutex<RunControl>,
}

impl TaskScheduler {
    /// Create a new scheduler; wrap it in an `Arc` to run tasks
    pub fn new(registry: Arc<TaskRegistry>, root_vars: Variables) -> Self {
        Self {
            registry,
            root_vars,
            store: Arc::new(NoopStateStore),
            config: SchedulerConfig::default(),
            next_index: AtomicU64::new(1),
            table: RwLock::new(TaskTable::default()),
            run: Mutex::new(RunControl::default()),
        }
    }

    /// Attach a persistence hook
    pub fn with_store(mut self, store: Arc<dyn TaskStateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn root_vars(&self) -> &Variables {
        &self.root_vars
    }

    pub(crate) fn store(&self) -> &Arc<dyn TaskStateStore> {
        &self.store
    }

    /// Register a top-level task of the main phase
    pub async fn add_root_task(&self, options: TaskOptions) -> Result<TaskIndex, SchedulerError> {
        self.new_task_state(options, None, self.root_vars.clone(), false)
            .await
    }

    /// Register a top-level task of the cleanup phase
    pub async fn add_cleanup_task(&self, options: TaskOptions) -> Result<TaskIndex, SchedulerError> {
        self.new_task_state(options, None, self.root_vars.clone(), true)
            .await
    }

    /// Allocate a new task state.
    ///
    /// The index is allocated under the table write lock, so list order and
    /// index order agree.
    pub(crate) async fn new_task_state(
        &self,
        options: TaskOptions,
        parent: Option<TaskIndex>,
        vars: Variables,
        is_cleanup: bool,
    ) -> Result<TaskIndex, SchedulerError> {
        let descriptor = self
            .registry
            .find(&options.name)
            .ok_or_else(|| SchedulerError::UnknownTaskName(options.name.clone()))?;

        let mut table = self.table.write().await;

        let depth = match parent {
            Some(parent_index) => {
                let parent_state = table
                    .states
                    .get(&parent_index)
                    .ok_or(SchedulerError::TaskNotFound(parent_index))?;
                parent_state.depth() + 1
            }
            None => 0,
        };

        let index = self.next_index.fetch_add(1, AtomicOrdering::SeqCst);
        let task_id = options.id.clone();
        let state = Arc::new(TaskState::new(
            index,
            options,
            descriptor,
            parent,
            depth,
            is_cleanup,
            vars.clone(),
            self.config.log_buffer_size,
        ));

        if !task_id.is_empty() {
            vars.get_sub_scope(env::vars::TASKS_SCOPE)
                .set_sub_scope(&task_id, state.status_vars().clone());
        }

        table.states.insert(index, state);
        match (parent.is_none(), is_cleanup) {
            (true, false) => table.root_tasks.push(index),
            (true, true) => table.root_cleanup_tasks.push(index),
            _ => {}
        }
        if is_cleanup {
            table.all_cleanup_tasks.push(index);
        } else {
            table.all_tasks.push(index);
        }

        debug!(
            "Created task {} (parent: {:?}, depth: {}, cleanup: {})",
            index, parent, depth, is_cleanup
        );
        Ok(index)
    }

    pub async fn get_task_state(&self, index: TaskIndex) -> Option<Arc<TaskState>> {
        self.table.read().await.states.get(&index).cloned()
    }

    pub async fn get_task_status(&self, index: TaskIndex) -> Option<TaskStatus> {
        self.get_task_state(index).await.map(|s| s.status())
    }

    pub async fn get_task_count(&self) -> usize {
        self.table.read().await.states.len()
    }

    /// Main-phase tasks in pre-order, depth-first reporting order
    pub async fn get_all_tasks(&self) -> Vec<Arc<TaskState>> {
        let table = self.table.read().await;
        let mut list = table.all_tasks.clone();
        table.sort_task_list(&mut list);
        table.collect(&list)
    }

    pub async fn get_root_tasks(&self) -> Vec<Arc<TaskState>> {
        let table = self.table.read().await;
        table.collect(&table.root_tasks)
    }

    /// Cleanup-phase tasks in pre-order, depth-first reporting order
    pub async fn get_all_cleanup_tasks(&self) -> Vec<Arc<TaskState>> {
        let table = self.table.read().await;
        let mut list = table.all_cleanup_tasks.clone();
        table.sort_task_list(&mut list);
        table.collect(&list)
    }

    pub async fn get_root_cleanup_tasks(&self) -> Vec<Arc<TaskState>> {
        let table = self.table.read().await;
        table.collect(&table.root_cleanup_tasks)
    }

    /// Run every root task in order, then every cleanup task.
    ///
    /// The main phase stops at the first failing root task or when cancelled
    /// or timed out. Cleanup always runs afterwards under its own token, and
    /// cleanup failures are only logged.
    pub async fn run_tasks(
        self: &Arc<Self>,
        parent: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), SchedulerError> {
        let main = parent.child_token();
        let cleanup = parent.child_token();
        {
            let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
            if run.cancel_main {
                main.cancel();
            }
            if run.cancel_cleanup {
                cleanup.cancel();
            }
            run.main = Some(main.clone());
            run.cleanup = Some(cleanup.clone());
        }

        let timed_out = Arc::new(AtomicBool::new(false));
        if !timeout.is_zero() {
            let token = main.clone();
            let flag = timed_out.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        flag.store(true, AtomicOrdering::SeqCst);
                        warn!("Task run timed out after {:?}, cancelling", timeout);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        let root_tasks: Vec<TaskIndex> = self.table.read().await.root_tasks.clone();
        info!("Running {} root tasks", root_tasks.len());

        let mut run_error = None;
        for index in root_tasks {
            if main.is_cancelled() {
                break;
            }
            if let Err(err) = self.execute_task(&main, index, None).await {
                error!("Root task {} failed: {}", index, err);
                run_error = Some(err);
                break;
            }
        }

        // a failure caused by cancelling the main phase reports the cancellation
        let result = if main.is_cancelled() {
            if timed_out.load(AtomicOrdering::SeqCst) {
                Err(SchedulerError::RunTimeout(timeout))
            } else {
                Err(SchedulerError::Cancelled)
            }
        } else {
            match run_error {
                Some(err) => Err(err),
                None => Ok(()),
            }
        };
        main.cancel();

        let cleanup_tasks: Vec<TaskIndex> = self.table.read().await.root_cleanup_tasks.clone();
        if !cleanup_tasks.is_empty() {
            info!("Running {} cleanup tasks", cleanup_tasks.len());
        }
        for index in cleanup_tasks {
            if cleanup.is_cancelled() {
                warn!("Cleanup cancelled, skipping remaining cleanup tasks");
                break;
            }
            if let Err(err) = self.execute_task(&cleanup, index, None).await {
                warn!("Cleanup task {} failed: {}", index, err);
            }
        }
        cleanup.cancel();

        result
    }

    /// Cancel the main phase and, if requested, the cleanup phase.
    ///
    /// Idempotent; a cancel issued before `run_tasks` applies once it starts.
    pub fn cancel_tasks(&self, cancel_cleanup: bool) {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        run.cancel_main = true;
        if let Some(main) = &run.main {
            main.cancel();
        }
        if cancel_cleanup {
            run.cancel_cleanup = true;
            if let Some(cleanup) = &run.cleanup {
                cleanup.cancel();
            }
        }
    }
}
