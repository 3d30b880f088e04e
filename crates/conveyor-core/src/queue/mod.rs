//! Priority queue and task store.
//!
//! One aggregate owns both the ordered dispatch handles and the
//! authoritative task records. Splitting them would let "what's
//! dispatchable" drift from "what exists"; keeping them behind a single
//! lock makes enqueue/dequeue and the lifecycle store consistent.
//!
//! `dequeue` blocks cooperatively (notify + deadline); it never parks the
//! runtime thread, so workers and the scheduler share the runtime safely.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::task::{Task, TaskStatus};

// ---------------------------------------------------------------------------
// Heap entries
// ---------------------------------------------------------------------------

/// Dispatch handle: what sits in the priority structure. The task record
/// itself lives in the store map.
#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    priority: i64,
    /// Insertion sequence. Breaks ties among equal priorities in FIFO
    /// order; an artifact of the implementation, not a guarantee.
    seq: u64,
    task_id: Uuid,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the smallest (priority, seq)
        // pops first. The task id keeps the ordering total and consistent
        // with equality.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Derived counters over the queue and store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    /// Handles currently awaiting dispatch.
    pub current_size: usize,
    /// Tasks in `Queued` status.
    pub pending_count: usize,
    pub running_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<Uuid, Task>,
    seq: u64,
    total_enqueued: u64,
    total_dequeued: u64,
}

/// Thread-safe priority queue plus authoritative task store.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    /// Maximum pending handles; 0 means unbounded.
    capacity: usize,
}

impl TaskQueue {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a queue refusing enqueues beyond `capacity` pending handles.
    /// A capacity of 0 means unbounded.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                tasks: HashMap::new(),
                seq: 0,
                total_enqueued: 0,
                total_dequeued: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Record the task in the store, transition it to `Queued`, and push a
    /// dispatch handle.
    ///
    /// Returns `false` if a configured capacity bound is exceeded; the task
    /// is then neither stored nor queued.
    pub async fn enqueue(&self, mut task: Task) -> bool {
        {
            let mut inner = self.inner.lock().await;

            if self.capacity > 0 && inner.heap.len() >= self.capacity {
                warn!(
                    task_id = %task.task_id,
                    capacity = self.capacity,
                    "queue full, refusing task"
                );
                return false;
            }

            task.mark_queued();
            inner.seq += 1;
            let entry = HeapEntry {
                priority: task.priority,
                seq: inner.seq,
                task_id: task.task_id,
            };

            info!(
                task_id = %task.task_id,
                func = %task.func_name,
                priority = task.priority,
                "enqueued task"
            );

            inner.tasks.insert(task.task_id, task);
            inner.heap.push(entry);
            inner.total_enqueued += 1;
        }

        self.notify.notify_one();
        true
    }

    /// Wait up to `timeout` for a task and return the highest-priority one,
    /// or `None` on timeout.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register for a wakeup before checking, so an enqueue between
            // the check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);

            if let Some(task) = self.pop_highest().await {
                return Some(task);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => return None,
            }
        }
    }

    async fn pop_highest(&self) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        while let Some(entry) = inner.heap.pop() {
            // The store may have been cleared after the handle was pushed.
            if let Some(task) = inner.tasks.get(&entry.task_id).cloned() {
                inner.total_dequeued += 1;
                debug!(task_id = %entry.task_id, "dequeued task");
                return Some(task);
            }
        }
        None
    }

    /// Look up a task by id.
    pub async fn get(&self, task_id: Uuid) -> Option<Task> {
        let inner = self.inner.lock().await;
        inner.tasks.get(&task_id).cloned()
    }

    /// Replace the stored record for a task. Workers call this after each
    /// status transition.
    pub async fn update(&self, task: &Task) {
        let mut inner = self.inner.lock().await;
        inner.tasks.insert(task.task_id, task.clone());
    }

    /// Snapshot of all tasks, optionally filtered by status.
    pub async fn get_all(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect()
    }

    /// Number of handles currently awaiting dispatch.
    pub async fn size(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    /// Drop all pending handles and the entire store. The monotonic
    /// enqueue/dequeue counters are preserved.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.heap.clear();
        inner.tasks.clear();
        info!("queue cleared");
    }

    /// Derived counters over the queue and store.
    pub async fn metrics(&self) -> QueueMetrics {
        let inner = self.inner.lock().await;
        let count = |status: TaskStatus| inner.tasks.values().filter(|t| t.status == status).count();
        QueueMetrics {
            total_enqueued: inner.total_enqueued,
            total_dequeued: inner.total_dequeued,
            current_size: inner.heap.len(),
            pending_count: count(TaskStatus::Queued),
            running_count: count(TaskStatus::Running),
            completed_count: count(TaskStatus::Completed),
            failed_count: count(TaskStatus::Failed),
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
