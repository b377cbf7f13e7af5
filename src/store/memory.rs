//! In-memory `TaskStore` for tests and single-process embedding.
//!
//! Every operation takes the write lock for its whole duration, which makes
//! `conditional_update` a true compare-and-swap across concurrent callers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::traits::{CandidateQuery, TaskQueue, TaskStore, check_transition};
use crate::error::DatabaseError;
use crate::task::{Task, TaskPatch, TaskState, queue_order};

/// One successful conditional update, kept for inspection in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRecord {
    pub task_id: Uuid,
    pub from: TaskState,
    pub to: TaskState,
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: HashMap<Uuid, Task>,
    messages: Vec<(String, DateTime<Utc>)>,
    history: Vec<TransitionRecord>,
}

/// `TaskStore` backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    inner: RwLock<MemoryState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All state changes applied so far, in order. Field-only updates are
    /// not recorded.
    pub async fn history(&self) -> Vec<TransitionRecord> {
        self.inner.read().await.history.clone()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: &Task) -> Result<bool, DatabaseError> {
        let mut inner = self.inner.write().await;
        let duplicate = inner
            .tasks
            .values()
            .any(|t| t.id == task.id || t.correlation_id == task.correlation_id);
        if duplicate {
            debug!(correlation_id = %task.correlation_id, "Duplicate task insert ignored");
            return Ok(false);
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(true)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        Ok(self.inner.read().await.tasks.get(&id).cloned())
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        Ok(self.inner.write().await.tasks.remove(&id).is_some())
    }

    async fn get_candidates(&self, query: &CandidateQuery) -> Result<Vec<Task>, DatabaseError> {
        let inner = self.inner.read().await;
        let state = query.queue.state();
        let mut candidates: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.state == state && t.is_due(query.now))
            .filter(|t| match query.queue {
                TaskQueue::Qualification => true,
                TaskQueue::Execution(mode) => t.processing_mode == mode,
            })
            .cloned()
            .collect();
        candidates.sort_by(queue_order);
        candidates.truncate(query.limit);
        Ok(candidates)
    }

    async fn get_due_scheduled(
        &self,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let inner = self.inner.read().await;
        let mut due: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.state == TaskState::New)
            .filter(|t| t.scheduled_at.is_some_and(|at| at <= horizon))
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.scheduled_at, t.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected: TaskState,
        new: TaskState,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        check_transition(id, expected, new)?;

        let mut inner = self.inner.write().await;
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.state != expected {
            return Ok(false);
        }

        task.state = new;
        task.updated_at = now;
        patch.apply(task);

        if expected != new {
            inner.history.push(TransitionRecord {
                task_id: id,
                from: expected,
                to: new,
            });
        }
        Ok(true)
    }

    async fn count_by_state(&self, state: TaskState) -> Result<u64, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.values().filter(|t| t.state == state).count() as u64)
    }

    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>, DatabaseError> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect();
        tasks.sort_by(queue_order);
        Ok(tasks)
    }

    async fn find_stale(
        &self,
        state: TaskState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DatabaseError> {
        let inner = self.inner.read().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.state == state && t.updated_at < updated_before)
            .cloned()
            .collect();
        tasks.sort_by(queue_order);
        Ok(tasks)
    }

    async fn count_pending_of_type(&self, task_type: &str) -> Result<u64, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.task_type == task_type && !t.state.is_terminal())
            .count() as u64)
    }

    async fn record_message(
        &self,
        subject_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.inner
            .write()
            .await
            .messages
            .push((subject_id.to_string(), received_at));
        Ok(())
    }

    async fn message_count_since(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let inner = self.inner.read().await;
        Ok(inner
            .messages
            .iter()
            .filter(|(subject, at)| subject == subject_id && *at > since)
            .count() as u64)
    }
}
