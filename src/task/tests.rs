use crate::error::SchedulerError;
use crate::task::*;
use crate::vars::Variables;
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Behavior {
    Panic,
    Fail,
    BadConfig,
    /// Sets `Success` and then waits to be cancelled
    SucceedThenWait,
    /// Creates three `sleep` children from concurrent tokio tasks and runs them
    SpawnChildren,
}

struct MockTask {
    ctx: TaskContext,
    options: TaskOptions,
    behavior: Behavior,
}

#[async_trait]
impl Task for MockTask {
    fn config(&self) -> Value {
        self.options.config.clone()
    }

    fn timeout(&self) -> Duration {
        self.options.timeout
    }

    fn load_config(&mut self) -> Result<()> {
        if let Behavior::BadConfig = self.behavior {
            bail!("invalid mock config");
        }
        Ok(())
    }

    async fn execute(&mut self, cancel: CancellationToken) -> Result<()> {
        match self.behavior {
            Behavior::Panic => panic!("mock task exploded"),
            Behavior::Fail => Err(anyhow!("mock failure")),
            Behavior::BadConfig => Ok(()),
            Behavior::SucceedThenWait => {
                self.ctx.set_result(TaskResult::Success);
                cancel.cancelled().await;
                Err(anyhow!("cancelled"))
            }
            Behavior::SpawnChildren => {
                let mut handles = Vec::new();
                for _ in 0..3 {
                    let ctx = self.ctx.clone();
                    handles.push(tokio::spawn(async move {
                        ctx.new_task(
                            TaskOptions::new("sleep").with_config(json!({"duration": "1ms"})),
                            None,
                        )
                        .await
                    }));
                }
                let mut children = Vec::new();
                for handle in handles {
                    children.push(handle.await??);
                }
                children.sort();
                for child in children {
                    self.ctx.execute_task(&cancel, child, None).await?;
                }
                Ok(())
            }
        }
    }
}

fn mock_descriptor(name: &str, behavior: Behavior) -> TaskDescriptor {
    TaskDescriptor::new(name, "mock task", Value::Null, move |ctx, options| {
        Ok(Box::new(MockTask {
            ctx,
            options,
            behavior,
        }) as Box<dyn Task>)
    })
}

fn test_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::builtin();
    registry
        .register(mock_descriptor("mock_panic", Behavior::Panic))
        .register(mock_descriptor("mock_fail", Behavior::Fail))
        .register(mock_descriptor("mock_bad_config", Behavior::BadConfig))
        .register(mock_descriptor("mock_succeed_wait", Behavior::SucceedThenWait))
        .register(mock_descriptor("mock_spawn", Behavior::SpawnChildren))
        .register(TaskDescriptor::new(
            "mock_factory_error",
            "factory always fails",
            Value::Null,
            |_, _| Err(anyhow!("cannot build task")),
        ));
    registry
}

fn create_scheduler() -> Arc<TaskScheduler> {
    Arc::new(TaskScheduler::new(Arc::new(test_registry()), Variables::new()))
}

fn sleep_task(duration: &str) -> TaskOptions {
    TaskOptions::new("sleep").with_config(json!({ "duration": duration }))
}

#[tokio::test]
async fn test_task_indices_strictly_increasing() {
    let scheduler = create_scheduler();

    let first = scheduler.add_root_task(sleep_task("1ms")).await.unwrap();
    let second = scheduler.add_cleanup_task(sleep_task("1ms")).await.unwrap();
    let third = scheduler.add_root_task(sleep_task("1ms")).await.unwrap();

    assert_eq!(first, 1);
    assert!(second > first);
    assert!(third > second);
    assert_eq!(scheduler.get_task_count().await, 3);
    assert_eq!(scheduler.get_root_tasks().await.len(), 2);
    assert_eq!(scheduler.get_root_cleanup_tasks().await.len(), 1);
}

#[tokio::test]
async fn test_unknown_task_name() {
    let scheduler = create_scheduler();
    let result = scheduler.add_root_task(TaskOptions::new("does_not_exist")).await;
    assert!(matches!(result, Err(SchedulerError::UnknownTaskName(name)) if name == "does_not_exist"));
    assert_eq!(scheduler.get_task_count().await, 0);
}

#[tokio::test]
async fn test_execute_sleep_task() {
    let scheduler = create_scheduler();
    let index = scheduler
        .add_root_task(sleep_task("10ms").with_title("nap"))
        .await
        .unwrap();

    let state = scheduler.get_task_state(index).await.unwrap();
    assert!(!state.is_started());
    assert_eq!(state.result(), TaskResult::None);

    scheduler
        .execute_task(&CancellationToken::new(), index, None)
        .await
        .unwrap();

    assert!(state.is_started());
    assert!(!state.is_running());
    assert!(!state.is_skipped());
    assert!(!state.is_timeout());
    assert_eq!(state.result(), TaskResult::Success);
    assert_eq!(state.title(), "nap");

    let status = state.status();
    assert!(status.start_time.is_some());
    assert!(status.stop_time.is_some());
    assert!(status.duration().unwrap() >= chrono::Duration::milliseconds(10));
    assert_eq!(status.config["duration"], json!("10ms"));
}

#[tokio::test]
async fn test_false_condition_skips_task() {
    let scheduler = create_scheduler();
    let index = scheduler
        .add_root_task(sleep_task("10s").with_if("|false"))
        .await
        .unwrap();

    timeout(
        Duration::from_secs(1),
        scheduler.execute_task(&CancellationToken::new(), index, None),
    )
    .await
    .expect("skipped task must not sleep")
    .unwrap();

    let state = scheduler.get_task_state(index).await.unwrap();
    assert!(state.is_started());
    assert!(state.is_skipped());
    assert!(!state.is_running());
    assert_eq!(state.result(), TaskResult::None);
}

#[tokio::test]
async fn test_condition_reads_variables() {
    let vars = Variables::new();
    vars.set_var("enabled", true);
    let scheduler = Arc::new(TaskScheduler::new(Arc::new(test_registry()), vars));
    let index = scheduler
        .add_root_task(sleep_task("1ms").with_if(".enabled"))
        .await
        .unwrap();

    scheduler
        .execute_task(&CancellationToken::new(), index, None)
        .await
        .unwrap();

    let state = scheduler.get_task_state(index).await.unwrap();
    assert!(!state.is_skipped());
    assert_eq!(state.result(), TaskResult::Success);
}

#[tokio::test]
async fn test_broken_condition_fails_task() {
    let scheduler = create_scheduler();
    let index = scheduler
        .add_root_task(sleep_task("1ms").with_if("(.a"))
        .await
        .unwrap();

    let result = scheduler
        .execute_task(&CancellationToken::new(), index, None)
        .await;
    assert!(matches!(result, Err(SchedulerError::Condition(_))));

    let state = scheduler.get_task_state(index).await.unwrap();
    assert_eq!(state.result(), TaskResult::Failure);
    assert!(state.error().is_some());
    assert!(!state.is_running());
}

#[tokio::test]
async fn test_task_timeout() {
    let scheduler = create_scheduler();
    let index = scheduler
        .add_root_task(sleep_task("5s").with_timeout(Duration::from_millis(20)))
        .await
        .unwrap();

    let result = timeout(
        Duration::from_secs(2),
        scheduler.execute_task(&CancellationToken::new(), index, None),
    )
    .await
    .expect("timeout must interrupt the task");
    assert!(matches!(result, Err(SchedulerError::TaskFailed { .. })));

    let state = scheduler.get_task_state(index).await.unwrap();
    assert!(state.is_timeout());
    assert!(!state.is_running());
    assert_eq!(state.result(), TaskResult::Failure);
}

#[tokio::test]
async fn test_panic_is_contained() {
    let scheduler = create_scheduler();
    let index = scheduler
        .add_root_task(TaskOptions::new("mock_panic"))
        .await
        .unwrap();

    // the panic is recorded on the task, not returned to the caller
    scheduler
        .execute_task(&CancellationToken::new(), index, None)
        .await
        .unwrap();

    let state = scheduler.get_task_state(index).await.unwrap();
    assert_eq!(state.result(), TaskResult::Failure);
    assert!(!state.is_running());
    let error = format!("{:#}", state.error().unwrap());
    assert!(error.contains("mock task exploded"), "unexpected error: {error}");
}

#[tokio::test]
async fn test_run_continues_after_panicking_root() {
    let scheduler = create_scheduler();
    let panicking = scheduler
        .add_root_task(TaskOptions::new("mock_panic"))
        .await
        .unwrap();
    let next = scheduler.add_root_task(sleep_task("1ms")).await.unwrap();

    scheduler
        .run_tasks(&CancellationToken::new(), Duration::ZERO)
        .await
        .unwrap();

    let panicking = scheduler.get_task_state(panicking).await.unwrap();
    assert_eq!(panicking.result(), TaskResult::Failure);
    let next = scheduler.get_task_state(next).await.unwrap();
    assert!(next.is_started());
    assert_eq!(next.result(), TaskResult::Success);
}

#[tokio::test]
async fn test_timeout_flag_matches_result() {
    // task finishes right around its deadline
    for _ in 0..20 {
        let scheduler = create_scheduler();
        let index = scheduler
            .add_root_task(sleep_task("5ms").with_timeout(Duration::from_millis(5)))
            .await
            .unwrap();
        let _ = scheduler
            .execute_task(&CancellationToken::new(), index, None)
            .await;

        let state = scheduler.get_task_state(index).await.unwrap();
        let failed = state.result() == TaskResult::Failure;
        assert_eq!(state.is_timeout(), failed, "timeout flag disagrees with result");
    }
}

#[tokio::test]
async fn test_execute_twice_is_rejected() {
    let scheduler = create_scheduler();
    let index = scheduler.add_root_task(sleep_task("1ms")).await.unwrap();
    let cancel = CancellationToken::new();

    scheduler.execute_task(&cancel, index, None).await.unwrap();
    let second = scheduler.execute_task(&cancel, index, None).await;
    assert!(matches!(second, Err(SchedulerError::AlreadyExecuted(i)) if i == index));
}

#[tokio::test]
async fn test_execute_unknown_index() {
    let scheduler = create_scheduler();
    let result = scheduler
        .execute_task(&CancellationToken::new(), 42, None)
        .await;
    assert!(matches!(result, Err(SchedulerError::TaskNotFound(42))));
}

#[tokio::test]
async fn test_load_config_failure() {
    let scheduler = create_scheduler();
    let index = scheduler
        .add_root_task(TaskOptions::new("mock_bad_config"))
        .await
        .unwrap();

    let result = scheduler
        .execute_task(&CancellationToken::new(), index, None)
        .await;
    assert!(matches!(result, Err(SchedulerError::Config(_))));

    let state = scheduler.get_task_state(index).await.unwrap();
    assert_eq!(state.result(), TaskResult::Failure);
    assert!(!state.is_running());
}

#[tokio::test]
async fn test_factory_failure_leaves_result_unset() {
    let scheduler = create_scheduler();
    let index = scheduler
        .add_root_task(TaskOptions::new("mock_factory_error"))
        .await
        .unwrap();

    let result = scheduler
        .execute_task(&CancellationToken::new(), index, None)
        .await;
    assert!(matches!(result, Err(SchedulerError::Construction(_))));

    let state = scheduler.get_task_state(index).await.unwrap();
    assert!(state.is_started());
    assert!(!state.is_running());
    assert_eq!(state.result(), TaskResult::None);
}

#[tokio::test]
async fn test_result_update_releases_all_waiters() {
    let scheduler = create_scheduler();
    let index = scheduler.add_root_task(sleep_task("1ms")).await.unwrap();
    let state = scheduler.get_task_state(index).await.unwrap();

    let first = state.result_update(TaskResult::None).unwrap();
    let second = state.result_update(TaskResult::None).unwrap();
    let waiters = tokio::spawn(async move {
        first.wait().await;
        second.wait().await;
    });

    state.set_result(TaskResult::Success, false);
    timeout(Duration::from_secs(1), waiters)
        .await
        .expect("waiters must be released")
        .unwrap();

    // already changed relative to `None`
    assert!(state.result_update(TaskResult::None).is_none());
}

#[tokio::test]
async fn test_result_update_ignores_same_value() {
    let scheduler = create_scheduler();
    let index = scheduler.add_root_task(sleep_task("1ms")).await.unwrap();
    let state = scheduler.get_task_state(index).await.unwrap();
    state.set_result(TaskResult::Failure, false);

    let update = state.result_update(TaskResult::Failure).unwrap();
    state.set_result(TaskResult::Failure, false);
    assert!(timeout(Duration::from_millis(50), update.wait()).await.is_err());

    let update = state.result_update(TaskResult::Failure).unwrap();
    state.set_result(TaskResult::Success, false);
    timeout(Duration::from_secs(1), update.wait())
        .await
        .expect("change must release the waiter");
}

#[tokio::test]
async fn test_explicit_result_with_watch_task_pass() {
    let scheduler = create_scheduler();
    let index = scheduler
        .add_root_task(TaskOptions::new("mock_succeed_wait"))
        .await
        .unwrap();

    timeout(
        Duration::from_secs(2),
        scheduler.execute_task(&CancellationToken::new(), index, Some(watch_task_pass())),
    )
    .await
    .expect("watcher must cancel the task")
    .unwrap();

    let state = scheduler.get_task_state(index).await.unwrap();
    assert_eq!(state.result(), TaskResult::Success);
    assert!(state.error().is_none());
}

#[tokio::test]
async fn test_reporting_order_is_preorder() {
    let scheduler = create_scheduler();
    let spawner = scheduler
        .add_root_task(TaskOptions::new("mock_spawn"))
        .await
        .unwrap();
    let sibling = scheduler.add_root_task(sleep_task("1ms")).await.unwrap();

    scheduler
        .run_tasks(&CancellationToken::new(), Duration::ZERO)
        .await
        .unwrap();

    let order: Vec<TaskIndex> = scheduler
        .get_all_tasks()
        .await
        .iter()
        .map(|s| s.index())
        .collect();
    assert_eq!(order.len(), 5);
    assert_eq!(order[0], spawner);
    assert_eq!(order[4], sibling);
    // children come right after their parent, in index order
    assert!(order[1] < order[2] && order[2] < order[3]);
    for child in &order[1..4] {
        let state = scheduler.get_task_state(*child).await.unwrap();
        assert_eq!(state.parent_index(), Some(spawner));
        assert_eq!(state.depth(), 1);
        assert_eq!(state.result(), TaskResult::Success);
    }
}

#[tokio::test]
async fn test_reporting_order_with_interleaved_creation() {
    let scheduler = create_scheduler();
    let vars = Variables::new();
    let r1 = scheduler.add_root_task(sleep_task("1ms")).await.unwrap();
    let r2 = scheduler.add_root_task(sleep_task("1ms")).await.unwrap();

    let child = |parent| {
        let scheduler = scheduler.clone();
        let vars = vars.clone();
        async move {
            scheduler
                .new_task_state(sleep_task("1ms"), Some(parent), vars, false)
                .await
                .unwrap()
        }
    };

    // later siblings and cousins are created before deeper descendants
    let a = child(r1).await;
    let c = child(r2).await;
    let b = child(r1).await;
    let a1 = child(a).await;
    let c1 = child(c).await;
    let a11 = child(a1).await;

    let order: Vec<TaskIndex> = scheduler
        .get_all_tasks()
        .await
        .iter()
        .map(|s| s.index())
        .collect();
    assert_eq!(order, vec![r1, a, a1, a11, b, r2, c, c1]);

    let depths: Vec<u32> = scheduler
        .get_all_tasks()
        .await
        .iter()
        .map(|s| s.depth())
        .collect();
    assert_eq!(depths, vec![0, 1, 2, 3, 1, 0, 1, 2]);
}

#[tokio::test]
async fn test_status_vars_published_by_id() {
    let scheduler = create_scheduler();
    let index = scheduler
        .add_root_task(sleep_task("1ms").with_id("nap"))
        .await
        .unwrap();
    let check = scheduler
        .add_root_task(sleep_task("1ms").with_if(".tasks.nap.result == \"success\""))
        .await
        .unwrap();

    scheduler
        .run_tasks(&CancellationToken::new(), Duration::ZERO)
        .await
        .unwrap();

    let (result, found) = scheduler
        .root_vars()
        .resolve_query(".tasks.nap.result")
        .unwrap();
    assert!(found);
    assert_eq!(result, json!("success"));
    let check_state = scheduler.get_task_state(check).await.unwrap();
    assert!(!check_state.is_skipped());
    assert_eq!(check_state.result(), TaskResult::Success);
    assert!(scheduler.get_task_state(index).await.unwrap().is_started());
}

#[tokio::test]
async fn test_cleanup_runs_after_failure() {
    let scheduler = create_scheduler();
    let failing = scheduler
        .add_root_task(TaskOptions::new("mock_fail"))
        .await
        .unwrap();
    let skipped = scheduler.add_root_task(sleep_task("1ms")).await.unwrap();
    let cleanup = scheduler.add_cleanup_task(sleep_task("1ms")).await.unwrap();

    let result = scheduler
        .run_tasks(&CancellationToken::new(), Duration::ZERO)
        .await;
    assert!(matches!(result, Err(SchedulerError::TaskFailed { index, .. }) if index == failing));

    assert!(!scheduler.get_task_state(skipped).await.unwrap().is_started());
    let cleanup_state = scheduler.get_task_state(cleanup).await.unwrap();
    assert!(cleanup_state.is_cleanup());
    assert_eq!(cleanup_state.result(), TaskResult::Success);
    assert_eq!(scheduler.get_all_cleanup_tasks().await.len(), 1);
}

#[tokio::test]
async fn test_cancel_tasks_is_idempotent() {
    let scheduler = create_scheduler();
    let index = scheduler.add_root_task(sleep_task("10s")).await.unwrap();
    let cleanup = scheduler.add_cleanup_task(sleep_task("1ms")).await.unwrap();

    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler
                .run_tasks(&CancellationToken::new(), Duration::ZERO)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.cancel_tasks(false);
    scheduler.cancel_tasks(false);

    let result = timeout(Duration::from_secs(2), runner)
        .await
        .expect("cancel must stop the run")
        .unwrap();
    assert!(matches!(result, Err(SchedulerError::Cancelled)));

    assert_eq!(
        scheduler.get_task_state(index).await.unwrap().result(),
        TaskResult::Failure
    );
    assert_eq!(
        scheduler.get_task_state(cleanup).await.unwrap().result(),
        TaskResult::Success
    );
}

#[tokio::test]
async fn test_cancel_before_run() {
    let scheduler = create_scheduler();
    let index = scheduler.add_root_task(sleep_task("1ms")).await.unwrap();
    let cleanup = scheduler.add_cleanup_task(sleep_task("1ms")).await.unwrap();

    scheduler.cancel_tasks(true);
    let result = scheduler
        .run_tasks(&CancellationToken::new(), Duration::ZERO)
        .await;

    assert!(matches!(result, Err(SchedulerError::Cancelled)));
    assert!(!scheduler.get_task_state(index).await.unwrap().is_started());
    assert!(!scheduler.get_task_state(cleanup).await.unwrap().is_started());
}

#[tokio::test]
async fn test_run_timeout() {
    let scheduler = create_scheduler();
    scheduler.add_root_task(sleep_task("1ms")).await.unwrap();
    scheduler.add_root_task(sleep_task("10s")).await.unwrap();

    let result = timeout(
        Duration::from_secs(2),
        scheduler.run_tasks(&CancellationToken::new(), Duration::from_millis(50)),
    )
    .await
    .expect("run deadline must stop the run");

    assert!(matches!(result, Err(SchedulerError::RunTimeout(_))));
}
