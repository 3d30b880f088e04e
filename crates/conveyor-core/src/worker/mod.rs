//! Worker pool: a fixed set of concurrent loops that pull tasks off the
//! queue, run the task body on the blocking pool, and drive retry and
//! timeout policy.
//!
//! Each worker holds at most one dequeued task at a time, and a dequeued
//! handle is not re-queued until the worker completes it or decides to
//! retry -- which is what guarantees at-most-one concurrent execution per
//! task instance. Task bodies are synchronous and possibly blocking, so
//! they run via `spawn_blocking`; with one in-flight body per worker the
//! blocking concurrency is bounded by `num_workers`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{EventKind, EventSink, TaskEvent};
use crate::queue::TaskQueue;
use crate::registry::{TaskArgs, TaskRegistry};
use crate::task::Task;

/// Default number of workers.
pub const DEFAULT_NUM_WORKERS: usize = 4;

/// How long a worker waits on the queue before re-checking for shutdown.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
/// Idle sleep after an empty dequeue; the dequeue timeout is the real
/// backpressure, this only prevents a tight spin on spurious wakeups.
const IDLE_SLEEP: Duration = Duration::from_millis(100);
/// Sleep after an internal worker-loop error, to avoid fault storms.
const FAULT_SLEEP: Duration = Duration::from_secs(1);

/// Worker pool statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub num_workers: usize,
    pub running: bool,
    pub active_workers: usize,
}

/// Manages a pool of workers that execute tasks.
pub struct WorkerPool {
    queue: Arc<TaskQueue>,
    registry: Arc<TaskRegistry>,
    events: Option<Arc<dyn EventSink>>,
    num_workers: usize,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a stopped pool of `num_workers` workers (at least one).
    pub fn new(queue: Arc<TaskQueue>, registry: Arc<TaskRegistry>, num_workers: usize) -> Self {
        Self {
            queue,
            registry,
            events: None,
            num_workers: num_workers.max(1),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Attach a sink for lifecycle events. Emission is best-effort: sink
    /// errors are logged and never fail a task.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Spawn the worker loops. A second call while running is a no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("worker pool already running");
            return;
        }

        info!(num_workers = self.num_workers, "starting worker pool");

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = cancel.clone();

        let mut workers = self.workers.lock().await;
        workers.clear();
        for worker_id in 0..self.num_workers {
            let ctx = WorkerContext {
                queue: Arc::clone(&self.queue),
                registry: Arc::clone(&self.registry),
                events: self.events.clone(),
                cancel: cancel.clone(),
            };
            workers.push(tokio::spawn(worker_loop(worker_id, ctx)));
        }

        info!("worker pool started");
    }

    /// Signal workers to exit at the next safe point. When `wait` is set,
    /// joins all workers before returning. A second call is a no-op.
    pub async fn stop(&self, wait: bool) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("worker pool already stopped");
            return;
        }

        info!("stopping worker pool");
        self.cancel.lock().await.cancel();

        if wait {
            let mut workers = self.workers.lock().await;
            for handle in workers.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "worker task join failed");
                }
            }
        }

        info!("worker pool stopped");
    }

    /// Current pool statistics.
    pub async fn stats(&self) -> WorkerStats {
        let workers = self.workers.lock().await;
        WorkerStats {
            num_workers: self.num_workers,
            running: self.running.load(Ordering::SeqCst),
            active_workers: workers.iter().filter(|h| !h.is_finished()).count(),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_workers", &self.num_workers)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Everything a single worker loop needs.
struct WorkerContext {
    queue: Arc<TaskQueue>,
    registry: Arc<TaskRegistry>,
    events: Option<Arc<dyn EventSink>>,
    cancel: CancellationToken,
}

/// Main worker loop: dequeue and execute until cancelled.
async fn worker_loop(worker_id: usize, ctx: WorkerContext) {
    info!(worker_id, "worker started");

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        let task = tokio::select! {
            task = ctx.queue.dequeue(DEQUEUE_TIMEOUT) => task,
            _ = ctx.cancel.cancelled() => break,
        };

        match task {
            Some(task) => {
                if let Err(e) = execute_task(worker_id, task, &ctx).await {
                    error!(worker_id, error = %e, "worker loop error");
                    tokio::select! {
                        _ = sleep(FAULT_SLEEP) => {}
                        _ = ctx.cancel.cancelled() => break,
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = sleep(IDLE_SLEEP) => {}
                    _ = ctx.cancel.cancelled() => break,
                }
            }
        }
    }

    info!(worker_id, "worker stopped");
}

/// Execute a single dequeued task through the full contract: transition to
/// running, resolve and run the body, then complete or route the failure
/// through retry policy.
async fn execute_task(worker_id: usize, mut task: Task, ctx: &WorkerContext) -> Result<()> {
    info!(
        worker_id,
        task_id = %task.task_id,
        func = %task.func_name,
        "executing task"
    );

    task.mark_running();
    ctx.queue.update(&task).await;
    emit_event(ctx, EventKind::TaskStarted, &task).await;

    let outcome = match ctx.registry.get(&task.func_name) {
        // A missing function is a task failure like any other; it goes
        // through the retry path, not up to the worker loop.
        Err(e) => Err(format!("NotFound: {e}")),
        Ok(func) => run_task_body(func, &task).await,
    };

    match outcome {
        Ok(result) => {
            task.mark_completed(result);
            ctx.queue.update(&task).await;
            emit_event(ctx, EventKind::TaskCompleted, &task).await;
            info!(task_id = %task.task_id, "task completed");
        }
        Err(error_msg) => {
            error!(task_id = %task.task_id, error = %error_msg, "task attempt failed");
            handle_task_failure(task, error_msg, ctx).await;
        }
    }

    Ok(())
}

/// Run the task body on the blocking pool, honoring the task's timeout.
///
/// Returns the body's value or an error string per the failure contract:
/// `"Task exceeded timeout of <T>s"` on timeout, `"<kind>: <message>"`
/// otherwise. A timed-out body keeps its blocking thread until it returns
/// on its own; it is never forcibly interrupted.
async fn run_task_body(
    func: crate::registry::TaskFn,
    task: &Task,
) -> Result<Value, String> {
    let args = TaskArgs::new(task.args.clone(), task.kwargs.clone());
    let handle = tokio::task::spawn_blocking(move || func(args));

    let joined = match task.timeout {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), handle).await {
            Ok(joined) => joined,
            Err(_elapsed) => return Err(format!("Task exceeded timeout of {secs}s")),
        },
        None => handle.await,
    };

    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(failure)) => Err(failure.to_string()),
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "task body panicked".to_string());
            Err(format!("panic: {message}"))
        }
        Err(join_err) => Err(format!("JoinError: {join_err}")),
    }
}

/// Route a failed attempt: bump the retry counter, then either fail the
/// task terminally or mark it retrying, back off, and re-enqueue.
async fn handle_task_failure(mut task: Task, error_msg: String, ctx: &WorkerContext) {
    // Increment first; `retry_count > max_retries` means retries are
    // exhausted, giving max_retries + 1 attempts in total.
    task.retry_count += 1;

    if !task.can_retry() {
        task.mark_failed(error_msg);
        ctx.queue.update(&task).await;
        emit_event(ctx, EventKind::TaskFailed, &task).await;
        error!(
            task_id = %task.task_id,
            retries = task.retry_count - 1,
            "task failed permanently"
        );
        return;
    }

    task.mark_retrying(error_msg.clone());
    ctx.queue.update(&task).await;
    emit_event(ctx, EventKind::TaskRetrying, &task).await;

    let backoff_secs = 2u64.saturating_pow(task.retry_count - 1);
    info!(
        task_id = %task.task_id,
        backoff_secs,
        attempt = task.retry_count,
        max_retries = task.max_retries,
        "retrying task"
    );

    // A stop signal cuts the backoff short; the task is still re-enqueued
    // so it survives into the next pool start instead of being lost
    // mid-retry.
    tokio::select! {
        _ = sleep(Duration::from_secs(backoff_secs)) => {}
        _ = ctx.cancel.cancelled() => {}
    }

    if !ctx.queue.enqueue(task.clone()).await {
        warn!(task_id = %task.task_id, "queue refused retry, failing task");
        task.mark_failed(error_msg);
        ctx.queue.update(&task).await;
        emit_event(ctx, EventKind::TaskFailed, &task).await;
    }
}

/// Emit a lifecycle event to the configured sink, best-effort.
async fn emit_event(ctx: &WorkerContext, kind: EventKind, task: &Task) {
    if let Some(sink) = &ctx.events {
        if let Err(e) = sink.emit(TaskEvent::new(kind, task)).await {
            error!(kind = %kind, error = %e, "event callback failed");
        }
    }
}
