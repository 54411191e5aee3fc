use conductor::task::{TaskIndex, TaskOptions, TaskRegistry, TaskResult, TaskScheduler};
use conductor::{SchedulerError, Variables};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn task(value: Value) -> TaskOptions {
    serde_json::from_value(value).expect("valid task options")
}

fn scheduler_with(vars: Variables) -> Arc<TaskScheduler> {
    Arc::new(TaskScheduler::new(Arc::new(TaskRegistry::builtin()), vars))
}

async fn run_single(scheduler: &Arc<TaskScheduler>, options: TaskOptions) -> (TaskIndex, Result<(), SchedulerError>) {
    let index = scheduler.add_root_task(options).await.unwrap();
    let result = scheduler
        .run_tasks(&CancellationToken::new(), Duration::from_secs(20))
        .await;
    (index, result)
}

async fn result_of(scheduler: &Arc<TaskScheduler>, index: TaskIndex) -> TaskResult {
    scheduler.get_task_state(index).await.unwrap().result()
}

/// A child that fails by running into its own timeout
fn failing_child() -> Value {
    json!({"name": "sleep", "timeout": "10ms", "config": {"duration": "5s"}})
}

#[tokio::test]
async fn test_sleep_reads_config_vars() {
    let vars = Variables::new();
    vars.set_var("nap", "5ms");
    let scheduler = scheduler_with(vars);

    let (index, result) = run_single(
        &scheduler,
        task(json!({"name": "sleep", "configVars": {"duration": ".nap"}})),
    )
    .await;

    result.unwrap();
    let state = scheduler.get_task_state(index).await.unwrap();
    assert_eq!(state.result(), TaskResult::Success);
    assert_eq!(state.config()["duration"], json!("5ms"));
}

#[tokio::test]
async fn test_run_tasks_sequential() {
    let scheduler = scheduler_with(Variables::new());
    let (root, result) = run_single(
        &scheduler,
        task(json!({
            "name": "run_tasks",
            "config": {"tasks": [
                {"name": "sleep", "config": {"duration": "1ms"}},
                {"name": "sleep", "config": {"duration": "1ms"}},
                {"name": "sleep", "config": {"duration": "1ms"}},
            ]},
        })),
    )
    .await;

    result.unwrap();
    let all = scheduler.get_all_tasks().await;
    assert_eq!(all.len(), 4);
    assert_eq!(all[0].index(), root);
    for child in &all[1..] {
        assert_eq!(child.parent_index(), Some(root));
        assert_eq!(child.result(), TaskResult::Success);
    }
    // sequential: each child starts after the previous one stopped
    for pair in all[1..].windows(2) {
        assert!(pair[0].stop_time().unwrap() <= pair[1].start_time().unwrap());
    }
}

#[tokio::test]
async fn test_run_tasks_stops_on_failure() {
    let scheduler = scheduler_with(Variables::new());
    let (root, result) = run_single(
        &scheduler,
        task(json!({
            "name": "run_tasks",
            "config": {"tasks": [
                failing_child(),
                {"name": "sleep", "config": {"duration": "1ms"}},
            ]},
        })),
    )
    .await;

    assert!(matches!(result, Err(SchedulerError::TaskFailed { .. })));
    assert_eq!(result_of(&scheduler, root).await, TaskResult::Failure);

    let all = scheduler.get_all_tasks().await;
    assert_eq!(all.len(), 3);
    assert!(all[1].is_timeout());
    assert!(!all[2].is_started());
}

#[tokio::test]
async fn test_run_tasks_continue_and_expect_failure() {
    let scheduler = scheduler_with(Variables::new());
    let (root, result) = run_single(
        &scheduler,
        task(json!({
            "name": "run_tasks",
            "config": {
                "continueOnFailure": true,
                "expectFailure": true,
                "tasks": [
                    failing_child(),
                    {"name": "sleep", "config": {"duration": "1ms"}},
                ],
            },
        })),
    )
    .await;

    result.unwrap();
    assert_eq!(result_of(&scheduler, root).await, TaskResult::Success);
    let all = scheduler.get_all_tasks().await;
    assert_eq!(all[1].result(), TaskResult::Failure);
    assert_eq!(all[2].result(), TaskResult::Success);
}

#[tokio::test]
async fn test_run_tasks_concurrent_fails_on_first_failure() {
    let scheduler = scheduler_with(Variables::new());
    let started = Instant::now();
    let (root, result) = run_single(
        &scheduler,
        task(json!({
            "name": "run_tasks_concurrent",
            "config": {"tasks": [
                failing_child(),
                {"name": "sleep", "config": {"duration": "10s"}},
            ]},
        })),
    )
    .await;

    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result_of(&scheduler, root).await, TaskResult::Failure);

    let state = scheduler.get_task_state(root).await.unwrap();
    let (failures, _) = state
        .outputs()
        .resolve_query(".failureCount")
        .unwrap();
    assert!(failures.as_u64().unwrap() >= 1);
    // the slow sibling was cancelled and has stopped
    for child in &scheduler.get_all_tasks().await[1..] {
        assert!(!child.is_running());
    }
}

#[tokio::test]
async fn test_run_tasks_concurrent_first_success_wins() {
    let scheduler = scheduler_with(Variables::new());
    let started = Instant::now();
    let (root, result) = run_single(
        &scheduler,
        task(json!({
            "name": "run_tasks_concurrent",
            "config": {
                "succeedTaskCount": 1,
                "failTaskCount": 0,
                "tasks": [
                    {"name": "sleep", "config": {"duration": "10s"}},
                    {"name": "sleep", "config": {"duration": "1ms"}},
                ],
            },
        })),
    )
    .await;

    result.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result_of(&scheduler, root).await, TaskResult::Success);
}

#[tokio::test]
async fn test_run_tasks_concurrent_rejects_impossible_success_count() {
    let scheduler = scheduler_with(Variables::new());
    let (root, result) = run_single(
        &scheduler,
        task(json!({
            "name": "run_tasks_concurrent",
            "config": {"succeedTaskCount": 3, "tasks": [{"name": "sleep"}]},
        })),
    )
    .await;

    assert!(matches!(result, Err(SchedulerError::Config(_))));
    assert_eq!(result_of(&scheduler, root).await, TaskResult::Failure);
}

#[tokio::test]
async fn test_run_task_matrix() {
    let scheduler = scheduler_with(Variables::new());
    let (root, result) = run_single(
        &scheduler,
        task(json!({
            "name": "run_task_matrix",
            "config": {
                "matrixVar": "delay",
                "matrixValues": ["1ms", "2ms", "3ms"],
                "runConcurrent": true,
                "maxConcurrent": 2,
                "task": {"name": "sleep", "configVars": {"duration": ".delay"}},
            },
        })),
    )
    .await;

    result.unwrap();
    assert_eq!(result_of(&scheduler, root).await, TaskResult::Success);

    let children = &scheduler.get_all_tasks().await[1..];
    let delays: Vec<Value> = children
        .iter()
        .map(|c| c.vars().get_var("delay").unwrap())
        .collect();
    assert_eq!(delays, vec![json!("1ms"), json!("2ms"), json!("3ms")]);
    for child in children {
        assert_eq!(child.result(), TaskResult::Success);
        assert_eq!(child.config()["duration"], child.vars().get_var("delay").unwrap());
    }
}

#[tokio::test]
async fn test_run_task_matrix_values_query() {
    let vars = Variables::new();
    vars.set_var("clients", json!([{"name": "a"}, {"name": "b"}]));
    let scheduler = scheduler_with(vars);

    let (_, result) = run_single(
        &scheduler,
        task(json!({
            "name": "run_task_matrix",
            "config": {
                "matrixVar": "client",
                "matrixValuesQuery": ".clients",
                "task": {"name": "sleep", "title": "check ${{ .client.name }}"},
            },
        })),
    )
    .await;

    result.unwrap();
    let titles: Vec<String> = scheduler.get_all_tasks().await[1..]
        .iter()
        .map(|c| c.title())
        .collect();
    assert_eq!(titles, vec!["check a".to_string(), "check b".to_string()]);
}

#[tokio::test]
async fn test_run_task_background_foreground_decides() {
    let scheduler = scheduler_with(Variables::new());
    let started = Instant::now();
    let (root, result) = run_single(
        &scheduler,
        task(json!({
            "name": "run_task_background",
            "config": {
                "foregroundTask": {"name": "sleep", "config": {"duration": "20ms"}},
                "backgroundTask": {"name": "sleep", "config": {"duration": "10s"}},
            },
        })),
    )
    .await;

    result.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result_of(&scheduler, root).await, TaskResult::Success);

    let children = &scheduler.get_all_tasks().await[1..];
    assert_eq!(children[0].result(), TaskResult::Success);
    assert!(children[1].is_started());
    assert!(!children[1].is_running());
}

#[tokio::test]
async fn test_run_task_background_fail_policy() {
    let scheduler = scheduler_with(Variables::new());
    let started = Instant::now();
    let (root, result) = run_single(
        &scheduler,
        task(json!({
            "name": "run_task_background",
            "config": {
                "onBackgroundComplete": "fail",
                "foregroundTask": {"name": "sleep", "config": {"duration": "10s"}},
                "backgroundTask": {"name": "sleep", "config": {"duration": "1ms"}},
            },
        })),
    )
    .await;

    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result_of(&scheduler, root).await, TaskResult::Failure);
}

#[tokio::test]
async fn test_run_task_options_rewrites_result() {
    let scheduler = scheduler_with(Variables::new());
    let inverted = scheduler
        .add_root_task(task(json!({
            "name": "run_task_options",
            "config": {"invertResult": true, "task": failing_child()},
        })))
        .await
        .unwrap();
    let ignored = scheduler
        .add_root_task(task(json!({
            "name": "run_task_options",
            "config": {"ignoreFailure": true, "task": failing_child()},
        })))
        .await
        .unwrap();

    scheduler
        .run_tasks(&CancellationToken::new(), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(result_of(&scheduler, inverted).await, TaskResult::Success);
    assert_eq!(result_of(&scheduler, ignored).await, TaskResult::Success);
}

#[tokio::test]
async fn test_new_variable_scope_isolates_children() {
    let vars = Variables::new();
    let scheduler = scheduler_with(vars.clone());
    let (_, result) = run_single(
        &scheduler,
        task(json!({
            "name": "run_tasks",
            "config": {
                "newVariableScope": true,
                "tasks": [{"name": "sleep", "id": "inner"}],
            },
        })),
    )
    .await;

    result.unwrap();
    let child = &scheduler.get_all_tasks().await[1];
    let (inner, found) = child.vars().resolve_query(".tasks.inner.result").unwrap();
    assert!(found);
    assert_eq!(inner, json!("success"));

    // the child's status is only published in the child scope
    let (outer, found) = vars.resolve_query(".tasks.inner.result").unwrap();
    assert!(!found, "unexpected value {outer}");
}
