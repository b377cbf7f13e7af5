//! Task record, retry bookkeeping and partial updates.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{ProcessingMode, TaskState};
use crate::clock::to_chrono;

/// Task type used for the synthetic idle-review task.
pub const IDLE_REVIEW_TASK_TYPE: &str = "IDLE_REVIEW";

/// Backoff bookkeeping for one failure family.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RetryState {
    /// Whether the task may be picked up again.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// The state after one more failure, retrying after `delay`.
    pub fn after_failure(&self, error: impl Into<String>, delay: Duration, now: DateTime<Utc>) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            next_retry_at: Some(now + to_chrono(delay)),
            last_error: Some(error.into()),
        }
    }

    /// Delay the next attempt without counting a failure.
    pub fn deferred(&self, delay: Duration, now: DateTime<Utc>) -> Self {
        Self {
            retry_count: self.retry_count,
            next_retry_at: Some(now + to_chrono(delay)),
            last_error: self.last_error.clone(),
        }
    }
}

/// Cron expression and next run for a recurring task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub cron_expression: Option<String>,
    pub next_run_at: DateTime<Utc>,
}

/// A unit of work with lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub processing_mode: ProcessingMode,
    pub task_type: String,
    pub state: TaskState,
    pub payload: serde_json::Value,
    /// Manual priority; lower runs first, unset runs last.
    pub queue_position: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub orchestration_started_at: Option<DateTime<Utc>>,
    pub qualification_retry: RetryState,
    pub dispatch_retry: RetryState,
    pub workspace_retry: RetryState,
    /// Idempotency key; unique across the store.
    pub correlation_id: String,
    /// Conversation or client the task is addressed to.
    pub subject_id: Option<String>,
    pub summary: Option<String>,
    pub result: Option<String>,
}

impl Task {
    /// Create a task in `NEW`. The correlation id defaults to the task id.
    pub fn new(
        task_type: impl Into<String>,
        processing_mode: ProcessingMode,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            processing_mode,
            task_type: task_type.into(),
            state: TaskState::New,
            payload,
            queue_position: None,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            cron_expression: None,
            orchestration_started_at: None,
            qualification_retry: RetryState::default(),
            dispatch_retry: RetryState::default(),
            workspace_retry: RetryState::default(),
            correlation_id: id.to_string(),
            subject_id: None,
            summary: None,
            result: None,
        }
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = state;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_queue_position(mut self, position: i64) -> Self {
        self.queue_position = Some(position);
        self
    }

    /// Attach a schedule. A cron expression makes the task recurring.
    pub fn with_schedule(mut self, at: DateTime<Utc>, cron_expression: Option<String>) -> Self {
        self.scheduled_at = Some(at);
        self.cron_expression = cron_expression;
        self
    }

    /// The schedule, if the task has one.
    pub fn schedule(&self) -> Option<ScheduleSpec> {
        self.scheduled_at.map(|next_run_at| ScheduleSpec {
            cron_expression: self.cron_expression.clone(),
            next_run_at,
        })
    }

    pub fn is_recurring(&self) -> bool {
        self.cron_expression.is_some()
    }

    /// One-shot copy of a scheduled task, queued for qualification.
    ///
    /// The correlation id is derived from the occurrence so that replicas
    /// racing on the same occurrence produce a single copy.
    pub fn execution_copy(&self, occurrence: DateTime<Utc>, now: DateTime<Utc>) -> Task {
        let mut copy = Task::new(
            self.task_type.clone(),
            self.processing_mode,
            self.payload.clone(),
            now,
        )
        .with_state(TaskState::ReadyForQualification)
        .with_correlation_id(format!(
            "{}:{}",
            self.correlation_id,
            occurrence.timestamp_millis()
        ));
        copy.subject_id = self.subject_id.clone();
        copy.queue_position = self.queue_position;
        copy
    }

    /// Retry gate for the queue this task is currently waiting in.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            TaskState::ReadyForQualification => self.qualification_retry.is_due(now),
            TaskState::ReadyForGpu => {
                self.dispatch_retry.is_due(now) && self.workspace_retry.is_due(now)
            }
            _ => true,
        }
    }

    pub fn is_idle_review(&self) -> bool {
        self.task_type == IDLE_REVIEW_TASK_TYPE
    }
}

/// Queue order: manual position ascending with unset last, then oldest first.
pub fn queue_order(a: &Task, b: &Task) -> Ordering {
    match (a.queue_position, b.queue_position) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Fields written alongside a conditional state update.
///
/// `None` leaves a field untouched; `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub payload: Option<serde_json::Value>,
    pub scheduled_at: Option<Option<DateTime<Utc>>>,
    pub orchestration_started_at: Option<Option<DateTime<Utc>>>,
    pub qualification_retry: Option<RetryState>,
    pub dispatch_retry: Option<RetryState>,
    pub workspace_retry: Option<RetryState>,
    pub summary: Option<Option<String>>,
    pub result: Option<Option<String>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn scheduled_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn orchestration_started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.orchestration_started_at = Some(at);
        self
    }

    pub fn qualification_retry(mut self, retry: RetryState) -> Self {
        self.qualification_retry = Some(retry);
        self
    }

    pub fn dispatch_retry(mut self, retry: RetryState) -> Self {
        self.dispatch_retry = Some(retry);
        self
    }

    pub fn workspace_retry(mut self, retry: RetryState) -> Self {
        self.workspace_retry = Some(retry);
        self
    }

    pub fn summary(mut self, summary: Option<String>) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn result(mut self, result: Option<String>) -> Self {
        self.result = Some(result);
        self
    }

    /// Write the set fields onto a task.
    pub fn apply(&self, task: &mut Task) {
        if let Some(payload) = &self.payload {
            task.payload = payload.clone();
        }
        if let Some(at) = self.scheduled_at {
            task.scheduled_at = at;
        }
        if let Some(at) = self.orchestration_started_at {
            task.orchestration_started_at = at;
        }
        if let Some(retry) = &self.qualification_retry {
            task.qualification_retry = retry.clone();
        }
        if let Some(retry) = &self.dispatch_retry {
            task.dispatch_retry = retry.clone();
        }
        if let Some(retry) = &self.workspace_retry {
            task.workspace_retry = retry.clone();
        }
        if let Some(summary) = &self.summary {
            task.summary = summary.clone();
        }
        if let Some(result) = &self.result {
            task.result = result.clone();
        }
    }
}
