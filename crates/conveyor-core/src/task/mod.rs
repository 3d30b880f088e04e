//! Task model: the unit of work, its lifecycle states, and the wire record.
//!
//! A [`Task`] is one invocation of a registered function with concrete
//! arguments. Workers drive it through its status transitions via the
//! `mark_*` helpers, which also own the timestamp invariants (`started_at`
//! on running, `completed_at` on a terminal state).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Canonical priority levels. Smaller value = dispatched sooner.
///
/// These are conveniences only; `Task::priority` accepts any integer and
/// ordering is purely numerical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    /// The numeric priority value used for queue ordering.
    pub fn value(self) -> i64 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl From<TaskPriority> for i64 {
    fn from(priority: TaskPriority) -> Self {
        priority.value()
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The unit of work: one invocation of a registered function.
#[derive(Debug, Clone)]
pub struct Task {
    /// Stable unique id, assigned at construction.
    pub task_id: Uuid,
    /// Registry key of the function to execute.
    pub func_name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Named arguments.
    pub kwargs: Map<String, Value>,
    /// Queue ordering key; smaller = higher priority.
    pub priority: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Fire time stamped by the scheduler on periodic instances.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only on a completed task.
    pub result: Option<Value>,
    /// Set on a failed or retrying task; during retries this is the most
    /// recent failure.
    pub error: Option<String>,
    pub retry_count: u32,
    /// The function executes at most `max_retries + 1` times in total.
    pub max_retries: u32,
    /// Per-attempt timeout in whole seconds; `None` means unbounded.
    pub timeout: Option<u64>,
    /// Reserved; never consulted by the engine.
    pub depends_on: Vec<Uuid>,
    /// Informational; set on instances spawned from a periodic definition.
    pub cron_expression: Option<String>,
}

impl Task {
    /// Create a new task in `Pending` state with default policy
    /// (normal priority, 3 retries, no timeout).
    pub fn new(func_name: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            func_name: func_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            priority: TaskPriority::Normal.value(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: 3,
            timeout: None,
            depends_on: Vec::new(),
            cron_expression: None,
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

    /// Transition to `Queued`. Called by the queue on enqueue.
    pub fn mark_queued(&mut self) {
        self.status = TaskStatus::Queued;
    }

    /// Transition to `Running` and stamp `started_at`.
    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transition to `Completed` with a result and stamp `completed_at`.
    pub fn mark_completed(&mut self, result: Value) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
    }

    /// Transition to terminal `Failed` with an error and stamp `completed_at`.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    /// Transition to `Retrying`, recording the failure that caused it.
    ///
    /// The caller owns the retry accounting; this does not touch
    /// `retry_count`.
    pub fn mark_retrying(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Retrying;
        self.error = Some(error.into());
    }

    /// Whether another attempt is allowed after `retry_count` was bumped
    /// for the failure at hand.
    pub fn can_retry(&self) -> bool {
        self.retry_count <= self.max_retries
    }
}

// ---------------------------------------------------------------------------
// Wire record
// ---------------------------------------------------------------------------

/// The serialized task record exchanged with external collaborators and
/// carried in lifecycle events. Timestamps serialize as ISO-8601.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub func_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub status: TaskStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id,
            func_name: task.func_name.clone(),
            args: task.args.clone(),
            kwargs: task.kwargs.clone(),
            status: task.status,
            priority: task.priority,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            result: task.result.clone(),
            error: task.error.clone(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_display_and_parse_roundtrip() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Retrying,
            TaskStatus::Cancelled,
        ];
        for status in all {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn status_parse_rejects_unknown() {
        let err = "exploded".parse::<TaskStatus>().unwrap_err();
        assert!(err.to_string().contains("exploded"));
    }

    #[test]
    fn priority_values_are_ordered() {
        assert!(TaskPriority::Critical.value() < TaskPriority::High.value());
        assert!(TaskPriority::High.value() < TaskPriority::Normal.value());
        assert!(TaskPriority::Normal.value() < TaskPriority::Low.value());
    }

    #[test]
    fn new_task_defaults() {
        let task = Task::new("add");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 2);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.retry_count, 0);
        assert!(task.timeout.is_none());
        assert!(task.result.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn mark_running_stamps_started_at() {
        let mut task = Task::new("add");
        assert!(task.started_at.is_none());
        task.mark_running();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn mark_completed_sets_result_and_completed_at() {
        let mut task = Task::new("add");
        task.mark_running();
        task.mark_completed(json!(8));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!(8)));
        assert!(task.completed_at.is_some());
        assert!(task.error.is_none());
    }

    #[test]
    fn mark_failed_sets_error_and_completed_at() {
        let mut task = Task::new("add");
        task.mark_running();
        task.mark_failed("boom");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(task.completed_at.is_some());
        assert!(task.result.is_none());
    }

    #[test]
    fn mark_retrying_keeps_retry_count_untouched() {
        let mut task = Task::new("add");
        task.retry_count = 2;
        task.mark_retrying("attempt 2 failed");
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error.as_deref(), Some("attempt 2 failed"));
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }

    #[test]
    fn record_serialization_roundtrip() {
        let mut kwargs = Map::new();
        kwargs.insert("a".to_string(), json!(5));
        kwargs.insert("b".to_string(), json!(3));

        let mut task = Task::new("add")
            .with_kwargs(kwargs)
            .with_priority(TaskPriority::High)
            .with_max_retries(2)
            .with_timeout(30);
        task.mark_running();
        task.mark_completed(json!(8));

        let record = TaskRecord::from(&task);
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: TaskRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn record_serializes_status_as_snake_case_string() {
        let mut task = Task::new("add");
        task.mark_running();
        let value = serde_json::to_value(TaskRecord::from(&task)).unwrap();
        assert_eq!(value["status"], json!("running"));
        assert_eq!(value["task_id"], json!(task.task_id.to_string()));
        // Unset optional fields are omitted from the wire form.
        assert!(value.get("completed_at").is_none());
        assert!(value.get("result").is_none());
    }
}
