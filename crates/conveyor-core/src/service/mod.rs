//! Service facade: wires the registry, queue, worker pool, scheduler, and
//! event bus together and enforces the external submission contract.
//!
//! Transport layers (an HTTP surface, a push channel) hold a
//! [`TaskService`] and translate their requests into these calls; the
//! facade owns validation so every entry point rejects unknown functions
//! and invalid cron expressions the same way.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::ConveyorConfig;
use crate::events::EventBus;
use crate::queue::{QueueMetrics, TaskQueue};
use crate::registry::TaskRegistry;
use crate::scheduler::cron::CronParseError;
use crate::scheduler::{PeriodicTask, PeriodicTaskView, Scheduler};
use crate::task::{Task, TaskRecord, TaskStatus};
use crate::worker::{WorkerPool, WorkerStats};

/// Errors rejecting a submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("task function {func_name:?} not found; registered: {registered:?}")]
    UnknownFunction {
        func_name: String,
        registered: Vec<String>,
    },

    #[error("queue is full, task {task_id} rejected")]
    QueueFull { task_id: Uuid },

    #[error(transparent)]
    InvalidCron(#[from] CronParseError),
}

fn default_priority() -> i64 {
    crate::task::TaskPriority::Normal.value()
}

fn default_max_retries() -> u32 {
    3
}

/// A one-shot task submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub func_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl TaskSubmission {
    /// Submission of `func_name` with default policy.
    pub fn new(func_name: impl Into<String>) -> Self {
        Self {
            func_name: func_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            priority: default_priority(),
            max_retries: default_max_retries(),
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_priority(mut self, priority: impl Into<i64>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }

    fn into_task(self) -> Task {
        let mut task = Task::new(self.func_name)
            .with_args(self.args)
            .with_kwargs(self.kwargs)
            .with_priority(self.priority)
            .with_max_retries(self.max_retries);
        task.timeout = self.timeout;
        task
    }
}

/// A periodic task submission: the one-shot fields plus a unique name and
/// a 5-field cron expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicSubmission {
    pub name: String,
    pub cron_expression: String,
    pub func_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl PeriodicSubmission {
    pub fn new(
        name: impl Into<String>,
        func_name: impl Into<String>,
        cron_expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            func_name: func_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            priority: default_priority(),
            max_retries: default_max_retries(),
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_priority(mut self, priority: impl Into<i64>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }
}

/// The assembled engine.
pub struct TaskService {
    registry: Arc<TaskRegistry>,
    queue: Arc<TaskQueue>,
    workers: WorkerPool,
    scheduler: Scheduler,
    bus: Arc<EventBus>,
}

impl TaskService {
    /// Assemble the engine around an already-populated registry.
    pub fn new(registry: Arc<TaskRegistry>, config: &ConveyorConfig) -> Self {
        let queue = Arc::new(TaskQueue::with_capacity(config.queue_capacity));
        let bus = Arc::new(EventBus::with_buffer(config.event_buffer));
        let workers = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            config.num_workers,
        )
        .with_event_sink(Arc::clone(&bus) as Arc<dyn crate::events::EventSink>);
        let scheduler = Scheduler::new(Arc::clone(&queue));

        Self {
            registry,
            queue,
            workers,
            scheduler,
            bus,
        }
    }

    /// Start the worker pool and the scheduler.
    pub async fn start(&self) {
        self.workers.start().await;
        self.scheduler.start().await;
        info!("conveyor started");
    }

    /// Stop the scheduler, then drain and join the workers.
    pub async fn shutdown(&self) {
        info!("shutting down conveyor");
        self.scheduler.stop().await;
        self.workers.stop(true).await;
        info!("conveyor shutdown complete");
    }

    /// Submit a task for execution.
    ///
    /// The function must exist in the registry; the returned record shows
    /// the task already in `Queued` state.
    pub async fn submit(&self, submission: TaskSubmission) -> Result<TaskRecord, SubmitError> {
        self.ensure_registered(&submission.func_name)?;

        let task = submission.into_task();
        let mut submitted = task.clone();

        if !self.queue.enqueue(task).await {
            return Err(SubmitError::QueueFull {
                task_id: submitted.task_id,
            });
        }

        // The queue marked its copy queued; mirror that on ours instead of
        // re-reading the store.
        submitted.mark_queued();
        Ok(TaskRecord::from(&submitted))
    }

    /// Register a periodic definition with the scheduler.
    pub async fn submit_periodic(&self, submission: PeriodicSubmission) -> Result<(), SubmitError> {
        self.ensure_registered(&submission.func_name)?;

        let periodic = PeriodicTask::new(
            submission.name,
            submission.func_name,
            submission.cron_expression,
        )?
        .with_args(submission.args)
        .with_kwargs(submission.kwargs)
        .with_priority(submission.priority)
        .with_max_retries(submission.max_retries);
        let periodic = match submission.timeout {
            Some(secs) => periodic.with_timeout(secs),
            None => periodic,
        };

        self.scheduler.add_periodic_task(periodic).await;
        Ok(())
    }

    fn ensure_registered(&self, func_name: &str) -> Result<(), SubmitError> {
        if self.registry.get(func_name).is_err() {
            return Err(SubmitError::UnknownFunction {
                func_name: func_name.to_string(),
                registered: self.registry.list(),
            });
        }
        Ok(())
    }

    /// Look up a task record by id.
    pub async fn task(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.queue
            .get(task_id)
            .await
            .map(|task| TaskRecord::from(&task))
    }

    /// All task records, optionally filtered by status, newest first.
    pub async fn tasks(&self, status: Option<TaskStatus>) -> Vec<TaskRecord> {
        let mut tasks = self.queue.get_all(status).await;
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.iter().map(TaskRecord::from).collect()
    }

    /// Queue and store counters.
    pub async fn metrics(&self) -> QueueMetrics {
        self.queue.metrics().await
    }

    /// Worker pool statistics.
    pub async fn worker_stats(&self) -> WorkerStats {
        self.workers.stats().await
    }

    /// Names of all registered task functions.
    pub fn registered_tasks(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Views of all periodic definitions.
    pub async fn periodic_tasks(&self) -> Vec<PeriodicTaskView> {
        self.scheduler.list_periodic_tasks().await
    }

    /// View of one periodic definition.
    pub async fn periodic_task(&self, name: &str) -> Option<PeriodicTaskView> {
        self.scheduler.get_periodic_task(name).await
    }

    /// Fire a periodic definition immediately; returns the instance id.
    pub async fn trigger_now(&self, name: &str) -> Option<Uuid> {
        self.scheduler.trigger_now(name).await
    }

    /// Remove a periodic definition. Returns whether it was present.
    pub async fn remove_periodic_task(&self, name: &str) -> bool {
        self.scheduler.remove_periodic_task(name).await
    }

    /// Drop all pending work and the task store.
    pub async fn clear_queue(&self) {
        self.queue.clear().await;
    }

    /// The event bus, for connecting observers.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
