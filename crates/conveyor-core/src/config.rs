//! Engine configuration.
//!
//! Tuning knobs for the service facade, resolvable through the chain:
//! environment variable > config file > default.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable overriding the worker count.
pub const ENV_NUM_WORKERS: &str = "CONVEYOR_NUM_WORKERS";
/// Environment variable overriding the queue capacity.
pub const ENV_QUEUE_CAPACITY: &str = "CONVEYOR_QUEUE_CAPACITY";
/// Environment variable overriding the per-observer event buffer.
pub const ENV_EVENT_BUFFER: &str = "CONVEYOR_EVENT_BUFFER";

/// Engine tuning configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConveyorConfig {
    /// Number of concurrent workers (and the bound on concurrent blocking
    /// task bodies).
    pub num_workers: usize,
    /// Maximum pending tasks in the queue; 0 means unbounded.
    pub queue_capacity: usize,
    /// Per-observer event channel depth.
    pub event_buffer: usize,
}

impl Default for ConveyorConfig {
    fn default() -> Self {
        Self {
            num_workers: crate::worker::DEFAULT_NUM_WORKERS,
            queue_capacity: 0,
            event_buffer: crate::events::DEFAULT_EVENT_BUFFER,
        }
    }
}

impl ConveyorConfig {
    /// Load configuration from a TOML file. Missing keys fall back to
    /// defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file at {}", path.display()))?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Resolve configuration: the file (when given), then environment
    /// overrides on top.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        apply_usize_var(ENV_NUM_WORKERS, &mut self.num_workers);
        apply_usize_var(ENV_QUEUE_CAPACITY, &mut self.queue_capacity);
        apply_usize_var(ENV_EVENT_BUFFER, &mut self.event_buffer);
    }
}

fn apply_usize_var(name: &str, target: &mut usize) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<usize>() {
            Ok(value) => *target = value,
            Err(_) => warn!(var = name, value = %raw, "ignoring unparseable env override"),
        }
    }
}
