//! Idle review: a synthetic background task created when nothing is in
//! flight, so the expensive backend can do housekeeping while idle.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::TaskOrchestrationEngine;
use crate::error::DatabaseError;
use crate::task::{IDLE_REVIEW_TASK_TYPE, ProcessingMode, Task, TaskState};

impl TaskOrchestrationEngine {
    /// One tick. Returns the id of the created review task, if any.
    ///
    /// The correlation id is bucketed by interval, so replicas ticking in
    /// the same interval create at most one review.
    pub async fn run_idle_review_cycle(&self) -> Result<Option<Uuid>, DatabaseError> {
        let config = &self.config.idle_review;
        if !config.enabled {
            return Ok(None);
        }

        for state in TaskState::ALL.into_iter().filter(TaskState::is_in_flight) {
            if self.store.count_by_state(state).await? > 0 {
                debug!(state = %state, "Work in flight, skipping idle review");
                return Ok(None);
            }
        }
        if self.store.count_pending_of_type(IDLE_REVIEW_TASK_TYPE).await? > 0 {
            return Ok(None);
        }

        let now = self.clock.now();
        let bucket = now.timestamp() / config.interval.as_secs().max(1) as i64;
        let task = Task::new(
            IDLE_REVIEW_TASK_TYPE,
            ProcessingMode::Background,
            json!({ "reason": "idle", "requested_at": now }),
            now,
        )
        .with_state(TaskState::ReadyForGpu)
        .with_correlation_id(format!("idle-review:{bucket}"));

        if self.store.insert_task(&task).await? {
            info!(task_id = %task.id, "Idle review queued");
            Ok(Some(task.id))
        } else {
            Ok(None)
        }
    }
}

/// Spawn the idle review loop.
pub(crate) fn spawn_idle_review_loop(engine: Arc<TaskOrchestrationEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = engine.config.idle_review.interval;
        info!("Idle review loop started (interval: {}s)", interval.as_secs());

        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a fresh start does
        // not enqueue a review before the other loops have run.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = engine.run_idle_review_cycle().await {
                warn!(error = %e, "Idle review tick failed");
            }
        }
    })
}
