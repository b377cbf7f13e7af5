//! `TaskStore` trait: the single source of truth for task state.
//!
//! All coordination between loops and between replicas goes through
//! `conditional_update`, a compare-and-swap on the task's state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::task::{ProcessingMode, Task, TaskPatch, TaskState};

/// The queue a candidate search runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskQueue {
    /// `READY_FOR_QUALIFICATION` with a due qualification retry.
    Qualification,
    /// `READY_FOR_GPU` in the given mode with due dispatch and workspace retries.
    Execution(ProcessingMode),
}

impl TaskQueue {
    pub fn state(&self) -> TaskState {
        match self {
            Self::Qualification => TaskState::ReadyForQualification,
            Self::Execution(_) => TaskState::ReadyForGpu,
        }
    }
}

/// Candidate search parameters.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub queue: TaskQueue,
    pub now: DateTime<Utc>,
    pub limit: usize,
}

impl CandidateQuery {
    pub fn new(queue: TaskQueue, now: DateTime<Utc>, limit: usize) -> Self {
        Self { queue, now, limit }
    }
}

/// Backend-agnostic task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Returns `false` if a task with the same
    /// correlation id already exists (idempotent create).
    async fn insert_task(&self, task: &Task) -> Result<bool, DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Tasks waiting in `query.queue`, in queue order, at most `query.limit`.
    async fn get_candidates(&self, query: &CandidateQuery) -> Result<Vec<Task>, DatabaseError>;

    /// `NEW` tasks with `scheduled_at <= horizon`, earliest first.
    async fn get_due_scheduled(
        &self,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Atomically move `id` from `expected` to `new`, writing `patch` and
    /// bumping `updated_at` to `now`.
    ///
    /// Returns `false` when the task is missing or no longer in `expected`
    /// (another caller won). Errors with `InvalidTransition` when the edge is
    /// not part of the state machine.
    async fn conditional_update(
        &self,
        id: Uuid,
        expected: TaskState,
        new: TaskState,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn count_by_state(&self, state: TaskState) -> Result<u64, DatabaseError>;

    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>, DatabaseError>;

    /// Tasks in `state` whose last update is older than `updated_before`.
    async fn find_stale(
        &self,
        state: TaskState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Non-terminal tasks of the given type.
    async fn count_pending_of_type(&self, task_type: &str) -> Result<u64, DatabaseError>;

    /// Record an inbound message addressed to a subject.
    async fn record_message(
        &self,
        subject_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Messages for `subject_id` received strictly after `since`.
    async fn message_count_since(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;
}

/// Reject edges outside the state machine before touching storage.
pub(crate) fn check_transition(
    id: Uuid,
    expected: TaskState,
    new: TaskState,
) -> Result<(), DatabaseError> {
    if expected.can_transition_to(new) {
        Ok(())
    } else {
        Err(DatabaseError::InvalidTransition {
            id,
            from: expected,
            to: new,
        })
    }
}
