//! Qualification loop: cheap classification with bounded fan-out.
//!
//! Transient qualifier failures are retried forever with backoff; only a
//! non-retriable failure parks a task in `ERROR`.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::TaskOrchestrationEngine;
use crate::collaborators::QualificationOutcome;
use crate::error::DatabaseError;
use crate::resilience::RetryFamily;
use crate::store::{CandidateQuery, TaskQueue};
use crate::task::{RetryState, Task, TaskPatch, TaskState};

impl TaskOrchestrationEngine {
    /// One tick: claim due candidates and qualify them concurrently.
    ///
    /// Returns how many tasks this engine claimed.
    pub async fn run_qualification_cycle(&self) -> Result<usize, DatabaseError> {
        let config = &self.config.qualification;
        let query = CandidateQuery::new(TaskQueue::Qualification, self.clock.now(), config.batch_size);
        let candidates = self.store.get_candidates(&query).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        // A failed claim skips that task only; everything already claimed
        // must still reach the qualifier or it would sit in QUALIFYING.
        let mut claimed = Vec::with_capacity(candidates.len());
        for task in candidates {
            let won = self
                .store
                .conditional_update(
                    task.id,
                    TaskState::ReadyForQualification,
                    TaskState::Qualifying,
                    &TaskPatch::new(),
                    self.clock.now(),
                )
                .await;
            match won {
                Ok(true) => claimed.push(task),
                Ok(false) => debug!(task_id = %task.id, "Lost qualification claim to another replica"),
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to claim task for qualification"),
            }
        }

        let count = claimed.len();
        if count > 0 {
            debug!(count, "Qualifying tasks");
        }
        futures::stream::iter(claimed)
            .for_each_concurrent(config.max_concurrency, |task| async move {
                if let Err(e) = self.qualify_one(&task).await {
                    warn!(task_id = %task.id, error = %e, "Failed to record qualification result");
                }
            })
            .await;
        Ok(count)
    }

    async fn qualify_one(&self, task: &Task) -> Result<(), DatabaseError> {
        let result = self.qualifier.qualify(task).await;
        let now = self.clock.now();

        let (to, patch) = match result {
            Ok(qualification) => {
                let to = match qualification.outcome {
                    QualificationOutcome::Done => TaskState::Done,
                    QualificationOutcome::NeedsExpensiveExecution => TaskState::ReadyForGpu,
                };
                info!(task_id = %task.id, outcome = %to, "Task qualified");
                let patch = TaskPatch::new()
                    .summary(qualification.summary)
                    .qualification_retry(RetryState::default());
                (to, patch)
            }
            Err(e) if e.retriable => {
                let attempt = task.qualification_retry.retry_count.saturating_add(1);
                let delay = self.retry.delay(RetryFamily::Qualification, attempt);
                warn!(
                    task_id = %task.id,
                    attempt,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Qualification failed, will retry"
                );
                let patch = TaskPatch::new()
                    .qualification_retry(task.qualification_retry.after_failure(e.message, delay, now));
                (TaskState::ReadyForQualification, patch)
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Qualification failed permanently");
                let patch = TaskPatch::new()
                    .result(Some(e.message.clone()))
                    .qualification_retry(RetryState {
                        last_error: Some(e.message),
                        ..task.qualification_retry.clone()
                    });
                (TaskState::Error, patch)
            }
        };

        let moved = self
            .store
            .conditional_update(task.id, TaskState::Qualifying, to, &patch, now)
            .await?;
        if !moved {
            warn!(task_id = %task.id, "Task left QUALIFYING before its result was recorded");
        }
        Ok(())
    }
}

/// Spawn the qualification loop.
pub(crate) fn spawn_qualification_loop(engine: Arc<TaskOrchestrationEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = engine.config.qualification.interval;
        info!("Qualification loop started (interval: {}s)", interval.as_secs());

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match engine.run_qualification_cycle().await {
                Ok(0) => {}
                Ok(count) => info!(count, "Qualification tick finished"),
                Err(e) => warn!(error = %e, "Qualification tick failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Qualification;
    use crate::error::QualificationError;
    use crate::store::TaskStore;
    use crate::task::ProcessingMode;
    use crate::testing::{FailingStore, TestHarness};
    use serde_json::json;

    fn queued(h: &TestHarness) -> Task {
        Task::new("DOCUMENT", ProcessingMode::Background, json!({"path": "a.pdf"}), h.clock.now())
            .with_state(TaskState::ReadyForQualification)
    }

    #[tokio::test]
    async fn outcomes_route_to_done_or_execution() {
        let h = TestHarness::new();
        let cheap = queued(&h);
        h.advance_secs(1);
        let expensive = queued(&h);
        h.insert(&cheap).await.unwrap();
        h.insert(&expensive).await.unwrap();

        h.qualifier.push(Ok(Qualification::done("spam")));
        h.qualifier.push(Ok(Qualification::needs_execution("contract review")));

        // Concurrency 1 keeps the scripted order aligned with queue order
        let mut config = h.config.clone();
        config.qualification.max_concurrency = 1;
        let h = TestHarness { config, ..h };
        let engine = h.replica();

        assert_eq!(engine.run_qualification_cycle().await.unwrap(), 2);
        let cheap = h.task(cheap.id).await.unwrap().unwrap();
        let expensive = h.task(expensive.id).await.unwrap().unwrap();
        assert_eq!(cheap.state, TaskState::Done);
        assert_eq!(cheap.summary.as_deref(), Some("spam"));
        assert_eq!(expensive.state, TaskState::ReadyForGpu);
    }

    #[tokio::test]
    async fn transient_failure_backs_off_and_never_errors() {
        let h = TestHarness::new();
        let task = queued(&h);
        h.insert(&task).await.unwrap();

        for attempt in 1..=3u32 {
            h.qualifier.push(Err(QualificationError::retriable("model timeout")));
            assert_eq!(h.engine.run_qualification_cycle().await.unwrap(), 1);
            let stored = h.task(task.id).await.unwrap().unwrap();
            assert_eq!(stored.state, TaskState::ReadyForQualification);
            assert_eq!(stored.qualification_retry.retry_count, attempt);

            // Not due until the backoff elapses
            assert_eq!(h.engine.run_qualification_cycle().await.unwrap(), 0);
            let wait = stored.qualification_retry.next_retry_at.unwrap() - h.clock.now();
            h.advance_secs(wait.num_seconds() as u64);
        }

        assert_eq!(h.engine.run_qualification_cycle().await.unwrap(), 1);
        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::ReadyForGpu);
        assert_eq!(stored.qualification_retry, RetryState::default());
    }

    #[tokio::test]
    async fn permanent_failure_goes_to_error() {
        let h = TestHarness::new();
        let task = queued(&h);
        h.insert(&task).await.unwrap();
        h.qualifier.push(Err(QualificationError::permanent("unreadable payload")));

        h.engine.run_qualification_cycle().await.unwrap();
        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Error);
        assert_eq!(stored.result.as_deref(), Some("unreadable payload"));
    }

    #[tokio::test]
    async fn failed_claim_does_not_strand_earlier_claims() {
        let h = TestHarness::new();
        let first = queued(&h);
        h.advance_secs(1);
        let second = queued(&h);
        h.insert(&first).await.unwrap();
        h.insert(&second).await.unwrap();

        // The second claim of the tick hits a store error
        let store = Arc::new(FailingStore::new(h.store.clone(), 2));
        let engine = h.engine_on(store.clone());

        assert_eq!(engine.run_qualification_cycle().await.unwrap(), 1);
        assert_eq!(h.qualifier.calls(), vec![first.id]);
        assert_eq!(h.task(first.id).await.unwrap().unwrap().state, TaskState::ReadyForGpu);
        assert_eq!(
            h.task(second.id).await.unwrap().unwrap().state,
            TaskState::ReadyForQualification
        );

        // The skipped task is picked up on the next tick
        assert_eq!(engine.run_qualification_cycle().await.unwrap(), 1);
        assert_eq!(h.qualifier.calls(), vec![first.id, second.id]);
        assert_eq!(h.task(second.id).await.unwrap().unwrap().state, TaskState::ReadyForGpu);
        assert_eq!(store.failures(), 1);
    }

    #[tokio::test]
    async fn batch_size_limits_claims() {
        let mut config = crate::config::OrchestratorConfig::default();
        config.qualification.batch_size = 2;
        let h = TestHarness::with_config(config);
        for _ in 0..5 {
            h.insert(&queued(&h)).await.unwrap();
        }

        assert_eq!(h.engine.run_qualification_cycle().await.unwrap(), 2);
        assert_eq!(h.store.count_by_state(TaskState::ReadyForQualification).await.unwrap(), 3);
    }
}
