//! Task function registry -- a named collection of callable task bodies.
//!
//! The registry lets the worker pool resolve functions by name at dispatch
//! time (a task only carries its `func_name`). It is a single process-wide
//! collaborator held by reference; registration typically happens at
//! startup, lookups happen concurrently during steady state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// Arguments passed to a task body: the task's positional and named values.
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Positional argument by index.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Named argument by key.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

/// A failure raised by a task body, rendered as `"<kind>: <message>"`.
///
/// `kind` plays the role of an exception type name: `"ValueError"`,
/// `"panic"`, whatever classifies the failure for observers.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TaskFailure {
    pub kind: String,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Shorthand for argument-marshalling failures.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new("InvalidArguments", message)
    }
}

/// A registered task body.
pub type TaskFn = Arc<dyn Fn(TaskArgs) -> Result<Value, TaskFailure> + Send + Sync>;

/// Errors from registry lookups.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("task function {0:?} not found in registry")]
    NotFound(String),
}

/// Handle returned by [`TaskRegistry::register`]: the bound name plus the
/// callable, so call sites can invoke the function directly and introspect
/// the name it was registered under.
#[derive(Clone)]
pub struct RegisteredTask {
    name: String,
    func: TaskFn,
}

impl RegisteredTask {
    /// The name this function is registered under.
    pub fn task_name(&self) -> &str {
        &self.name
    }

    /// Invoke the function directly, bypassing the queue.
    pub fn call(&self, args: TaskArgs) -> Result<Value, TaskFailure> {
        (self.func)(args)
    }
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A collection of registered task functions, keyed by name.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskFn>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task function under `name`.
    ///
    /// If the name is already bound the previous function is replaced and a
    /// warning is logged.
    pub fn register<F>(&self, name: impl Into<String>, func: F) -> RegisteredTask
    where
        F: Fn(TaskArgs) -> Result<Value, TaskFailure> + Send + Sync + 'static,
    {
        let name = name.into();
        let func: TaskFn = Arc::new(func);

        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        if tasks.insert(name.clone(), Arc::clone(&func)).is_some() {
            warn!(task_name = %name, "task already registered, overwriting");
        } else {
            debug!(task_name = %name, "registered task");
        }

        RegisteredTask { name, func }
    }

    /// Look up a task function by name.
    pub fn get(&self, name: &str) -> Result<TaskFn, RegistryError> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// List the names of all registered task functions.
    ///
    /// The order is not guaranteed (HashMap iteration order).
    pub fn list(&self) -> Vec<String> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks.keys().cloned().collect()
    }

    /// Remove a task function. Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let removed = tasks.remove(name).is_some();
        if removed {
            debug!(task_name = %name, "unregistered task");
        }
        removed
    }

    /// Return the number of registered task functions.
    pub fn len(&self) -> usize {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks.len()
    }

    /// Return `true` if no task functions are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("TaskRegistry")
            .field("tasks", &tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add(args: TaskArgs) -> Result<Value, TaskFailure> {
        let a = args
            .kwarg("a")
            .and_then(Value::as_i64)
            .ok_or_else(|| TaskFailure::invalid_args("missing integer kwarg 'a'"))?;
        let b = args
            .kwarg("b")
            .and_then(Value::as_i64)
            .ok_or_else(|| TaskFailure::invalid_args("missing integer kwarg 'b'"))?;
        Ok(json!(a + b))
    }

    #[test]
    fn registry_starts_empty() {
        let registry = TaskRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn register_and_get() {
        let registry = TaskRegistry::new();
        let handle = registry.register("add", add);
        assert_eq!(handle.task_name(), "add");

        let func = registry.get("add").unwrap();
        let mut kwargs = Map::new();
        kwargs.insert("a".to_string(), json!(5));
        kwargs.insert("b".to_string(), json!(3));
        let result = func(TaskArgs::new(vec![], kwargs)).unwrap();
        assert_eq!(result, json!(8));
    }

    #[test]
    fn registered_handle_is_callable() {
        let registry = TaskRegistry::new();
        let handle = registry.register("greet", |args: TaskArgs| {
            let name = args
                .arg(0)
                .and_then(Value::as_str)
                .unwrap_or("world")
                .to_string();
            Ok(json!(format!("hello, {name}")))
        });

        let result = handle.call(TaskArgs::new(vec![json!("ferris")], Map::new()));
        assert_eq!(result.unwrap(), json!("hello, ferris"));
    }

    #[test]
    fn register_replaces_existing() {
        let registry = TaskRegistry::new();
        registry.register("answer", |_| Ok(json!(41)));
        registry.register("answer", |_| Ok(json!(42)));
        assert_eq!(registry.len(), 1);

        let func = registry.get("answer").unwrap();
        assert_eq!(func(TaskArgs::default()).unwrap(), json!(42));
    }

    #[test]
    fn get_missing_returns_not_found() {
        let registry = TaskRegistry::new();
        let err = match registry.get("nonexistent") {
            Err(e) => e,
            Ok(_) => panic!("expected RegistryError::NotFound"),
        };
        assert!(matches!(err, RegistryError::NotFound(_)));
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn unregister_removes_task() {
        let registry = TaskRegistry::new();
        registry.register("cleanup", |_| Ok(Value::Null));
        assert!(registry.unregister("cleanup"));
        assert!(!registry.unregister("cleanup"));
        assert!(registry.get("cleanup").is_err());
    }

    #[test]
    fn list_returns_all_names() {
        let registry = TaskRegistry::new();
        registry.register("alpha", |_| Ok(Value::Null));
        registry.register("beta", |_| Ok(Value::Null));
        registry.register("gamma", |_| Ok(Value::Null));

        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn task_failure_display_matches_contract() {
        let failure = TaskFailure::new("ValueError", "cannot divide by zero");
        assert_eq!(failure.to_string(), "ValueError: cannot divide by zero");
    }

    #[test]
    fn registry_debug_shows_names() {
        let registry = TaskRegistry::new();
        registry.register("visible-task", |_| Ok(Value::Null));
        let debug = format!("{registry:?}");
        assert!(debug.contains("visible-task"));
    }
}
