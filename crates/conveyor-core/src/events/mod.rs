//! Lifecycle event fan-out.
//!
//! Two delivery modes: broadcast (every connected observer sees every
//! event) and per-task subscription (observers following a single task id).
//! Observers are bounded mpsc channels; a send that cannot complete
//! immediately disconnects the observer. Events are never buffered beyond
//! the per-observer channel and never persisted -- an observer that
//! connects mid-task misses earlier events.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::task::{Task, TaskRecord};

/// Default per-observer channel depth.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Lifecycle transition kinds delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetrying,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskRetrying => "task_retrying",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event: the kind, the task's wire record at transition time,
/// and a timestamp (`completed_at` when the task has one, else
/// `created_at`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub event_type: EventKind,
    pub task: TaskRecord,
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new(event_type: EventKind, task: &Task) -> Self {
        Self {
            event_type,
            task: TaskRecord::from(task),
            timestamp: task.completed_at.unwrap_or(task.created_at),
        }
    }
}

/// Receiver of lifecycle events -- the seam between the worker pool and
/// whatever delivers events onward. Emission is best-effort: the worker
/// logs and swallows errors, they never fail the task.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: TaskEvent) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Identifies a connected observer.
pub type SubscriberId = Uuid;

/// Connection and subscription statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub total_connections: usize,
    pub active_subscriptions: usize,
    pub subscribed_tasks: Vec<Uuid>,
}

struct BusInner {
    connections: HashMap<SubscriberId, mpsc::Sender<TaskEvent>>,
    subscriptions: HashMap<Uuid, HashSet<SubscriberId>>,
}

/// Broadcast channel with per-task-id subscriptions.
pub struct EventBus {
    inner: Mutex<BusInner>,
    buffer: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_EVENT_BUFFER)
    }

    /// Create a bus whose observers each get a channel of `buffer` events.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                connections: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
            buffer: buffer.max(1),
        }
    }

    /// Connect a new observer. Returns its id and the receiving end of its
    /// event channel.
    pub fn connect(&self) -> (SubscriberId, mpsc::Receiver<TaskEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.connections.insert(id, tx);
        debug!(
            subscriber_id = %id,
            total = inner.connections.len(),
            "observer connected"
        );
        (id, rx)
    }

    /// Connect a new observer and wrap its receiver as a `Stream`.
    pub fn connect_stream(&self) -> (SubscriberId, ReceiverStream<TaskEvent>) {
        let (id, rx) = self.connect();
        (id, ReceiverStream::new(rx))
    }

    /// Disconnect an observer and drop all of its subscriptions.
    pub fn disconnect(&self, id: SubscriberId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::remove_observer(&mut inner, id);
    }

    fn remove_observer(inner: &mut BusInner, id: SubscriberId) {
        if inner.connections.remove(&id).is_none() {
            return;
        }
        inner.subscriptions.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
        debug!(
            subscriber_id = %id,
            total = inner.connections.len(),
            "observer disconnected"
        );
    }

    /// Subscribe a connected observer to a specific task's events.
    pub fn subscribe(&self, id: SubscriberId, task_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.connections.contains_key(&id) {
            warn!(subscriber_id = %id, "subscribe from unknown observer ignored");
            return;
        }
        inner.subscriptions.entry(task_id).or_default().insert(id);
        debug!(subscriber_id = %id, task_id = %task_id, "observer subscribed to task");
    }

    /// Drop an observer's subscription to a specific task.
    pub fn unsubscribe(&self, id: SubscriberId, task_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subscribers) = inner.subscriptions.get_mut(&task_id) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                inner.subscriptions.remove(&task_id);
            }
        }
    }

    /// Deliver an event to every connected observer. Observers whose
    /// channel is full or closed are disconnected.
    pub fn broadcast(&self, event: &TaskEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let failed: Vec<SubscriberId> = inner
            .connections
            .iter()
            .filter(|(_, tx)| tx.try_send(event.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();

        for id in failed {
            warn!(subscriber_id = %id, "dropping observer (slow or closed)");
            Self::remove_observer(&mut inner, id);
        }
    }

    /// Deliver an event to the observers subscribed to `task_id`, with the
    /// same drop-on-failure semantics as [`EventBus::broadcast`].
    pub fn send_to_task_subscribers(&self, task_id: Uuid, event: &TaskEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(subscribers) = inner.subscriptions.get(&task_id) else {
            return;
        };

        let failed: Vec<SubscriberId> = subscribers
            .iter()
            .filter(|id| match inner.connections.get(*id) {
                Some(tx) => tx.try_send(event.clone()).is_err(),
                None => true,
            })
            .copied()
            .collect();

        for id in failed {
            warn!(subscriber_id = %id, "dropping task subscriber (slow or closed)");
            Self::remove_observer(&mut inner, id);
        }
    }

    pub fn stats(&self) -> BusStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        BusStats {
            total_connections: inner.connections.len(),
            active_subscriptions: inner.subscriptions.len(),
            subscribed_tasks: inner.subscriptions.keys().copied().collect(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("EventBus")
            .field("connections", &inner.connections.len())
            .field("subscriptions", &inner.subscriptions.len())
            .finish()
    }
}

#[async_trait]
impl EventSink for EventBus {
    /// Forward a lifecycle event: first to the task's subscribers, then to
    /// every connected observer.
    async fn emit(&self, event: TaskEvent) -> anyhow::Result<()> {
        self.send_to_task_subscribers(event.task.task_id, &event);
        self.broadcast(&event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn started_event(task: &Task) -> TaskEvent {
        TaskEvent::new(EventKind::TaskStarted, task)
    }

    #[test]
    fn event_kind_wire_names() {
        assert_eq!(EventKind::TaskStarted.as_str(), "task_started");
        assert_eq!(
            serde_json::to_value(EventKind::TaskRetrying).unwrap(),
            serde_json::json!("task_retrying")
        );
    }

    #[test]
    fn event_timestamp_prefers_completed_at() {
        let mut task = Task::new("noop");
        let event = started_event(&task);
        assert_eq!(event.timestamp, task.created_at);

        task.mark_running();
        task.mark_completed(serde_json::json!(null));
        let event = TaskEvent::new(EventKind::TaskCompleted, &task);
        assert_eq!(Some(event.timestamp), task.completed_at);
    }

    #[test]
    fn event_serializes_type_field() {
        let task = Task::new("noop");
        let value = serde_json::to_value(started_event(&task)).unwrap();
        assert_eq!(value["type"], serde_json::json!("task_started"));
        assert_eq!(value["task"]["func_name"], serde_json::json!("noop"));
    }

    #[tokio::test]
    async fn broadcast_reaches_all_observers() {
        let bus = EventBus::new();
        let (_id_a, mut rx_a) = bus.connect();
        let (_id_b, mut rx_b) = bus.connect();

        let task = Task::new("noop");
        bus.broadcast(&started_event(&task));

        assert_eq!(rx_a.recv().await.unwrap().task.task_id, task.task_id);
        assert_eq!(rx_b.recv().await.unwrap().task.task_id, task.task_id);
    }

    #[tokio::test]
    async fn task_subscribers_only_see_their_task() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.connect();

        let watched = Task::new("watched");
        let other = Task::new("other");
        bus.subscribe(id, watched.task_id);

        bus.send_to_task_subscribers(other.task_id, &started_event(&other));
        bus.send_to_task_subscribers(watched.task_id, &started_event(&watched));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task.task_id, watched.task_id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_observer_is_dropped() {
        let bus = EventBus::with_buffer(1);
        let (_id, mut rx) = bus.connect();

        let task = Task::new("noop");
        // First event fills the buffer, second finds it full.
        bus.broadcast(&started_event(&task));
        bus.broadcast(&started_event(&task));

        assert_eq!(bus.stats().total_connections, 0);
        // The event already buffered is still deliverable.
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn disconnect_removes_subscriptions() {
        let bus = EventBus::new();
        let (id, rx) = bus.connect();
        let task = Task::new("noop");
        bus.subscribe(id, task.task_id);

        assert_eq!(bus.stats().active_subscriptions, 1);
        bus.disconnect(id);
        let stats = bus.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_subscriptions, 0);
        drop(rx);
    }

    #[tokio::test]
    async fn closed_receiver_is_dropped_on_send() {
        let bus = EventBus::new();
        let (_id, rx) = bus.connect();
        drop(rx);

        let task = Task::new("noop");
        bus.broadcast(&started_event(&task));
        assert_eq!(bus.stats().total_connections, 0);
    }

    #[tokio::test]
    async fn subscribe_from_unknown_observer_is_ignored() {
        let bus = EventBus::new();
        bus.subscribe(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(bus.stats().active_subscriptions, 0);
    }

    #[tokio::test]
    async fn emit_sends_to_subscribers_and_broadcasts() {
        let bus = EventBus::new();
        let (id, mut subscribed_rx) = bus.connect();
        let (_other, mut broadcast_rx) = bus.connect();

        let task = Task::new("noop");
        bus.subscribe(id, task.task_id);

        bus.emit(started_event(&task)).await.unwrap();

        // The subscriber sees the event twice: once via its subscription,
        // once via the broadcast.
        assert!(subscribed_rx.recv().await.is_some());
        assert!(subscribed_rx.try_recv().is_ok());
        // The plain observer sees it once.
        assert!(broadcast_rx.recv().await.is_some());
        assert!(broadcast_rx.try_recv().is_err());
    }
}
