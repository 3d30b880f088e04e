//! Scheduler integration tests: periodic definitions driving a real queue
//! and worker pool.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use conveyor_core::queue::TaskQueue;
use conveyor_core::registry::{TaskArgs, TaskRegistry};
use conveyor_core::scheduler::{PeriodicTask, Scheduler};
use conveyor_core::task::{Task, TaskStatus};
use conveyor_core::worker::WorkerPool;

fn registry_with_noop() -> Arc<TaskRegistry> {
    let registry = Arc::new(TaskRegistry::new());
    registry.register("noop", |_args: TaskArgs| Ok(json!(null)));
    registry
}

async fn wait_for_status(
    queue: &TaskQueue,
    task_id: Uuid,
    status: TaskStatus,
    timeout: Duration,
) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(task) = queue.get(task_id).await {
            if task.status == status {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} did not reach {status} within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn triggered_instance_runs_to_completion() {
    let registry = registry_with_noop();
    let queue = Arc::new(TaskQueue::new());
    let pool = WorkerPool::new(Arc::clone(&queue), registry, 1);
    let scheduler = Scheduler::new(Arc::clone(&queue));
    pool.start().await;

    scheduler
        .add_periodic_task(PeriodicTask::new("manual", "noop", "0 0 * * *").unwrap())
        .await;

    let task_id = scheduler.trigger_now("manual").await.unwrap();
    let done = wait_for_status(&queue, task_id, TaskStatus::Completed, Duration::from_secs(5)).await;
    pool.stop(true).await;

    assert_eq!(done.cron_expression.as_deref(), Some("0 0 * * *"));
    assert!(done.scheduled_at.is_some());

    // Manual triggering leaves the schedule untouched.
    let view = scheduler.get_periodic_task("manual").await.unwrap();
    assert_eq!(view.run_count, 0);
    assert!(view.last_run.is_none());
}

#[tokio::test]
async fn stop_interrupts_tick_sleep_promptly() {
    let queue = Arc::new(TaskQueue::new());
    let scheduler = Scheduler::new(queue);
    scheduler.start().await;

    let started = tokio::time::Instant::now();
    scheduler.stop().await;

    // The 1s tick sleep is cancelled, not waited out.
    assert!(started.elapsed() < Duration::from_millis(900));
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn loop_survives_definition_churn() {
    let queue = Arc::new(TaskQueue::new());
    let scheduler = Scheduler::new(Arc::clone(&queue));
    scheduler.start().await;

    for i in 0..5 {
        let name = format!("def-{i}");
        scheduler
            .add_periodic_task(PeriodicTask::new(&name, "noop", "* * * * *").unwrap())
            .await;
    }
    assert_eq!(scheduler.list_periodic_tasks().await.len(), 5);

    tokio::time::sleep(Duration::from_millis(200)).await;

    for i in 0..5 {
        assert!(scheduler.remove_periodic_task(&format!("def-{i}")).await);
    }
    assert!(scheduler.list_periodic_tasks().await.is_empty());

    scheduler.stop().await;
}

/// End-to-end cron fire: an every-minute definition must fire within 65
/// seconds and its instance must complete. Gated behind `--ignored` for
/// wall-clock time.
#[tokio::test]
#[ignore]
async fn every_minute_cron_fires_and_completes() {
    let registry = registry_with_noop();
    let queue = Arc::new(TaskQueue::new());
    let pool = WorkerPool::new(Arc::clone(&queue), registry, 1);
    let scheduler = Scheduler::new(Arc::clone(&queue));
    pool.start().await;
    scheduler.start().await;

    scheduler
        .add_periodic_task(PeriodicTask::new("minutely", "noop", "* * * * *").unwrap())
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(65);
    loop {
        let view = scheduler.get_periodic_task("minutely").await.unwrap();
        if view.run_count >= 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "periodic task did not fire within 65s"
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    // The fired instance reaches the store and completes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let completed = queue.get_all(Some(TaskStatus::Completed)).await;
        if completed
            .iter()
            .any(|t| t.cron_expression.as_deref() == Some("* * * * *"))
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "fired instance did not complete"
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let view = scheduler.get_periodic_task("minutely").await.unwrap();
    assert!(view.last_run.is_some());

    scheduler.stop().await;
    pool.stop(true).await;
}

#[tokio::test]
async fn instance_template_honors_args() {
    let registry = Arc::new(TaskRegistry::new());
    registry.register("echo", |args: TaskArgs| {
        Ok(args.arg(0).cloned().unwrap_or(Value::Null))
    });

    let queue = Arc::new(TaskQueue::new());
    let pool = WorkerPool::new(Arc::clone(&queue), registry, 1);
    let scheduler = Scheduler::new(Arc::clone(&queue));
    pool.start().await;

    scheduler
        .add_periodic_task(
            PeriodicTask::new("echoer", "echo", "0 0 * * *")
                .unwrap()
                .with_args(vec![json!("hello")]),
        )
        .await;

    let task_id = scheduler.trigger_now("echoer").await.unwrap();
    let done = wait_for_status(&queue, task_id, TaskStatus::Completed, Duration::from_secs(5)).await;
    pool.stop(true).await;

    assert_eq!(done.result, Some(json!("hello")));
}
