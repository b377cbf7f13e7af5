//! Cron schedule evaluation for recurring tasks.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ScheduleError;

/// Parse a cron expression, accepting the classic 5-field form by
/// prefixing a zero seconds field.
pub fn parse(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidSchedule {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Next fire time strictly after `after`.
pub fn next_occurrence(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    parse(expression)?
        .after(&after)
        .find(|at| *at > after)
        .ok_or_else(|| ScheduleError::Exhausted(expression.to_string()))
}
