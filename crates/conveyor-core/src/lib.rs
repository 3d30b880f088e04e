//! Conveyor: an in-process task execution service.
//!
//! Clients submit named units of work with arguments, priorities, retry
//! policies, and optional timeouts; a fixed pool of workers executes them
//! concurrently; a cron-driven scheduler injects recurring work; and
//! observers receive real-time lifecycle events.
//!
//! # Architecture
//!
//! ```text
//! TaskService
//!     |
//!     |  submit(...) ----> TaskQueue (priority heap + task store)
//!     |                        ^  |
//!     |                enqueue |  | dequeue
//!     |                        |  v
//!     |  Scheduler (cron) --+  WorkerPool --get(func_name)--> TaskRegistry
//!     |                                |
//!     |                                +--emit--> EventBus --> observers
//! ```
//!
//! Task bodies are synchronous and possibly blocking; workers run them on
//! the blocking pool so the cooperative runtime stays responsive. Failures
//! are retried with exponential backoff up to `max_retries`, giving each
//! task at most `max_retries + 1` attempts.

pub mod config;
pub mod events;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod task;
pub mod worker;

// Re-export the primary public API at the crate root.
pub use config::ConveyorConfig;
pub use events::{EventBus, EventKind, EventSink, SubscriberId, TaskEvent};
pub use queue::{QueueMetrics, TaskQueue};
pub use registry::{RegisteredTask, RegistryError, TaskArgs, TaskFailure, TaskFn, TaskRegistry};
pub use scheduler::cron::CronParseError;
pub use scheduler::{PeriodicTask, PeriodicTaskView, Scheduler};
pub use service::{PeriodicSubmission, SubmitError, TaskService, TaskSubmission};
pub use task::{Task, TaskPriority, TaskRecord, TaskStatus};
pub use worker::{WorkerPool, WorkerStats};
