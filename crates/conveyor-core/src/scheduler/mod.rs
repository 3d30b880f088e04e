//! Periodic task scheduler: fires cron-defined templates into the queue.
//!
//! A [`PeriodicTask`] is a template; each fire stamps a fresh [`Task`]
//! instance and enqueues it. The loop ticks about once a second and fires
//! at most one instance per definition per tick -- after a long pause the
//! recomputed `next_run` lands past `now`, so historical misses collapse
//! into a single fire instead of a burst.

pub mod cron;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use self::cron::{CronParseError, Schedule, next_fire, parse_cron};
use crate::queue::TaskQueue;
use crate::task::{Task, TaskPriority};

/// Tick granularity of the scheduler loop.
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Sleep after a failed tick, to avoid fault storms.
const FAULT_SLEEP: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Periodic definitions
// ---------------------------------------------------------------------------

/// A recurring task definition: a template plus a compiled cron schedule.
#[derive(Debug, Clone)]
pub struct PeriodicTask {
    pub name: String,
    pub func_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub priority: i64,
    pub max_retries: u32,
    pub timeout: Option<u64>,
    pub cron_expression: String,
    schedule: Schedule,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub enabled: bool,
}

/// Serializable view of a periodic definition, as reported by
/// [`Scheduler::list_periodic_tasks`]. Timestamps serialize as ISO-8601.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicTaskView {
    pub name: String,
    pub func_name: String,
    pub cron_expression: String,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub enabled: bool,
}

impl PeriodicTask {
    /// Create a definition with default policy (normal priority, 3 retries,
    /// no timeout, enabled). Fails if the cron expression does not parse.
    pub fn new(
        name: impl Into<String>,
        func_name: impl Into<String>,
        cron_expression: impl Into<String>,
    ) -> Result<Self, CronParseError> {
        let cron_expression = cron_expression.into();
        let schedule = parse_cron(&cron_expression)?;
        let now = Utc::now();
        // A 5-field schedule always has an upcoming fire; fall back to the
        // far future if the crate ever disagrees.
        let next_run =
            next_fire(&schedule, now).unwrap_or(DateTime::<Utc>::MAX_UTC);

        Ok(Self {
            name: name.into(),
            func_name: func_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            priority: TaskPriority::Normal.value(),
            max_retries: 3,
            timeout: None,
            cron_expression,
            schedule,
            next_run,
            last_run: None,
            run_count: 0,
            enabled: true,
        })
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

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Whether the definition is due at `now`.
    pub fn should_run(&self, now: DateTime<Utc>) -> bool {
        self.enabled && now >= self.next_run
    }

    /// Stamp a fresh task instance from this template.
    pub fn create_instance(&self, now: DateTime<Utc>) -> Task {
        let mut task = Task::new(self.func_name.clone())
            .with_args(self.args.clone())
            .with_kwargs(self.kwargs.clone())
            .with_priority(self.priority)
            .with_max_retries(self.max_retries);
        task.timeout = self.timeout;
        task.cron_expression = Some(self.cron_expression.clone());
        task.scheduled_at = Some(now);
        task
    }

    /// Record a fire: set `last_run`, bump `run_count`, and advance
    /// `next_run` strictly past `now`.
    pub fn mark_executed(&mut self, now: DateTime<Utc>) {
        self.last_run = Some(now);
        self.run_count += 1;
        match next_fire(&self.schedule, now) {
            Some(next) => self.next_run = next,
            None => {
                warn!(
                    name = %self.name,
                    cron = %self.cron_expression,
                    "schedule has no upcoming fire times, disabling"
                );
                self.enabled = false;
            }
        }
    }
}

impl From<&PeriodicTask> for PeriodicTaskView {
    fn from(task: &PeriodicTask) -> Self {
        Self {
            name: task.name.clone(),
            func_name: task.func_name.clone(),
            cron_expression: task.cron_expression.clone(),
            next_run: task.next_run,
            last_run: task.last_run,
            run_count: task.run_count,
            enabled: task.enabled,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Manages periodic definitions and the loop that fires them.
pub struct Scheduler {
    queue: Arc<TaskQueue>,
    definitions: Arc<Mutex<HashMap<String, PeriodicTask>>>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self {
            queue,
            definitions: Arc::new(Mutex::new(HashMap::new())),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            handle: Mutex::new(None),
        }
    }

    /// Store a periodic definition under its name, overwriting any
    /// existing definition with that name.
    pub async fn add_periodic_task(&self, task: PeriodicTask) {
        let mut definitions = self.definitions.lock().await;
        let name = task.name.clone();
        if definitions.insert(name.clone(), task).is_some() {
            warn!(name = %name, "periodic task already defined, overwriting");
        } else {
            info!(name = %name, "added periodic task");
        }
    }

    /// Remove a periodic definition. Returns whether it was present.
    pub async fn remove_periodic_task(&self, name: &str) -> bool {
        let mut definitions = self.definitions.lock().await;
        let removed = definitions.remove(name).is_some();
        if removed {
            info!(name = %name, "removed periodic task");
        }
        removed
    }

    /// Look up a definition by name.
    pub async fn get_periodic_task(&self, name: &str) -> Option<PeriodicTaskView> {
        let definitions = self.definitions.lock().await;
        definitions.get(name).map(PeriodicTaskView::from)
    }

    /// Views of all definitions, in no particular order.
    pub async fn list_periodic_tasks(&self) -> Vec<PeriodicTaskView> {
        let definitions = self.definitions.lock().await;
        definitions.values().map(PeriodicTaskView::from).collect()
    }

    /// Enable or disable a definition. Returns whether it was present.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut definitions = self.definitions.lock().await;
        match definitions.get_mut(name) {
            Some(task) => {
                task.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Fabricate and enqueue an instance of a definition immediately,
    /// without touching `last_run`/`next_run`. Returns the new task id,
    /// or `None` if the definition does not exist or the queue refused it.
    ///
    /// Fires even when the definition is disabled; `enabled` only gates
    /// the scheduler loop.
    pub async fn trigger_now(&self, name: &str) -> Option<Uuid> {
        let instance = {
            let definitions = self.definitions.lock().await;
            match definitions.get(name) {
                Some(task) => task.create_instance(Utc::now()),
                None => {
                    warn!(name = %name, "periodic task not found");
                    return None;
                }
            }
        };

        let task_id = instance.task_id;
        if self.queue.enqueue(instance).await {
            info!(name = %name, task_id = %task_id, "manually triggered periodic task");
            Some(task_id)
        } else {
            warn!(name = %name, "queue refused manually triggered task");
            None
        }
    }

    /// Spawn the scheduler loop. A second call while running is a no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().await = cancel.clone();

        let queue = Arc::clone(&self.queue);
        let definitions = Arc::clone(&self.definitions);
        *self.handle.lock().await = Some(tokio::spawn(scheduler_loop(queue, definitions, cancel)));

        info!("scheduler started");
    }

    /// Signal the loop to exit and join it. A second call is a no-op.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("scheduler already stopped");
            return;
        }

        info!("stopping scheduler");
        self.cancel.lock().await.cancel();

        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler task join failed");
            }
        }

        info!("scheduler stopped");
    }

    /// Whether the loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Main scheduler loop: tick, fire due definitions, sleep, until cancelled.
async fn scheduler_loop(
    queue: Arc<TaskQueue>,
    definitions: Arc<Mutex<HashMap<String, PeriodicTask>>>,
    cancel: CancellationToken,
) {
    info!("scheduler loop started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if let Err(e) = tick(&queue, &definitions).await {
            error!(error = %e, "scheduler tick failed");
            tokio::select! {
                _ = sleep(FAULT_SLEEP) => {}
                _ = cancel.cancelled() => break,
            }
            continue;
        }

        tokio::select! {
            _ = sleep(TICK_INTERVAL) => {}
            _ = cancel.cancelled() => break,
        }
    }

    info!("scheduler loop stopped");
}

/// Fire every enabled definition whose `next_run` has passed.
async fn tick(
    queue: &TaskQueue,
    definitions: &Mutex<HashMap<String, PeriodicTask>>,
) -> Result<()> {
    let now = Utc::now();
    let mut definitions = definitions.lock().await;

    for (name, periodic) in definitions.iter_mut() {
        if !periodic.should_run(now) {
            continue;
        }

        let instance = periodic.create_instance(now);
        let task_id = instance.task_id;

        if !queue.enqueue(instance).await {
            // Leave next_run in the past; the next tick retries once
            // capacity frees up.
            warn!(name = %name, "queue refused periodic task instance");
            continue;
        }

        periodic.mark_executed(now);
        info!(
            name = %name,
            task_id = %task_id,
            next_run = %periodic.next_run,
            "scheduled periodic task"
        );
    }

    Ok(())
}
