//! Cron expression parsing for the 5-field dialect.
//!
//! Externally the engine speaks standard 5-field cron
//! (minute hour day-of-month month day-of-week) with literals, ranges,
//! steps, lists, and wildcards. The `cron` crate wants a leading seconds
//! field, so expressions are validated for field count here and normalized
//! with a `0` seconds field before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use ::cron::Schedule;

/// Errors from parsing a cron expression.
#[derive(Debug, Error)]
pub enum CronParseError {
    #[error(
        "cron expression {expression:?} must have 5 fields \
         (minute hour day-of-month month day-of-week), found {found}"
    )]
    FieldCount { expression: String, found: usize },

    #[error("invalid cron expression {expression:?}: {source}")]
    Invalid {
        expression: String,
        #[source]
        source: ::cron::error::Error,
    },
}

/// Parse a 5-field cron expression into a compiled [`Schedule`].
pub fn parse_cron(expression: &str) -> Result<Schedule, CronParseError> {
    let trimmed = expression.trim();
    let found = trimmed.split_whitespace().count();
    if found != 5 {
        return Err(CronParseError::FieldCount {
            expression: expression.to_string(),
            found,
        });
    }

    let normalized = format!("0 {trimmed}");
    Schedule::from_str(&normalized).map_err(|source| CronParseError::Invalid {
        expression: expression.to_string(),
        source,
    })
}

/// The first fire time strictly after `after`, if the schedule has one.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}
