//! Startup recovery of tasks left in transient states by a crash.
//!
//! Only tasks whose `updated_at` is older than the stale threshold are
//! touched, so executions owned by a live replica (which heartbeats) are
//! left alone.

use serde::Serialize;
use tracing::{info, warn};

use super::TaskOrchestrationEngine;
use crate::clock::to_chrono;
use crate::error::DatabaseError;
use crate::task::{ProcessingMode, Task, TaskPatch, TaskState};

/// Counts of recovered tasks by where they were sent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// `QUALIFYING` back to `READY_FOR_QUALIFICATION`.
    pub requalified: usize,
    /// `DISPATCHED_GPU` or background `PYTHON_ORCHESTRATING` back to
    /// `READY_FOR_GPU`.
    pub requeued: usize,
    /// Foreground `PYTHON_ORCHESTRATING` closed as `COMPLETED`.
    pub completed: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.requalified + self.requeued + self.completed
    }
}

impl TaskOrchestrationEngine {
    /// Move stale transient tasks back to a state a loop will pick up.
    ///
    /// Retry counters are left untouched. A failure on one task is logged
    /// and the rest are still processed.
    pub async fn recover_stale_tasks(&self) -> Result<RecoveryReport, DatabaseError> {
        let now = self.clock.now();
        let cutoff = now - to_chrono(self.config.recovery.stale_threshold);
        let mut report = RecoveryReport::default();

        for state in TaskState::TRANSIENT {
            let stale = self.store.find_stale(state, cutoff).await?;
            for task in stale {
                let (to, patch) = recovery_target(&task);
                match self.store.conditional_update(task.id, state, to, &patch, now).await {
                    Ok(true) => {
                        info!(task_id = %task.id, from = %state, to = %to, "Recovered stale task");
                        match to {
                            TaskState::ReadyForQualification => report.requalified += 1,
                            TaskState::Completed => report.completed += 1,
                            _ => report.requeued += 1,
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warn!(task_id = %task.id, error = %e, "Failed to recover stale task"),
                }
            }
        }
        Ok(report)
    }
}

fn recovery_target(task: &Task) -> (TaskState, TaskPatch) {
    match (task.state, task.processing_mode) {
        // Any mode: qualification has no side effects, and nothing else
        // ever moves a task out of QUALIFYING.
        (TaskState::Qualifying, _) => (TaskState::ReadyForQualification, TaskPatch::new()),
        // An interactive reply that outlived its requester is not rerun.
        (TaskState::PythonOrchestrating, ProcessingMode::Foreground) => {
            (TaskState::Completed, TaskPatch::new())
        }
        _ => (
            TaskState::ReadyForGpu,
            TaskPatch::new().orchestration_started_at(None),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::RetryState;
    use crate::testing::TestHarness;
    use serde_json::json;

    fn stuck(h: &TestHarness, state: TaskState, mode: ProcessingMode) -> Task {
        let mut task = Task::new("doc", mode, json!({}), h.clock.now()).with_state(state);
        if state == TaskState::PythonOrchestrating {
            task.orchestration_started_at = Some(h.clock.now());
        }
        task
    }

    #[tokio::test]
    async fn stuck_qualifying_is_requalified_with_retries_kept() {
        let h = TestHarness::new();
        let mut task = stuck(&h, TaskState::Qualifying, ProcessingMode::Background);
        task.qualification_retry = RetryState {
            retry_count: 2,
            next_retry_at: None,
            last_error: Some("timeout".into()),
        };
        h.insert(&task).await.unwrap();
        h.advance_secs(15 * 60);

        let report = h.engine.recover_stale_tasks().await.unwrap();
        assert_eq!(report.requalified, 1);
        assert_eq!(report.total(), 1);
        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::ReadyForQualification);
        assert_eq!(stored.qualification_retry.retry_count, 2);
    }

    #[tokio::test]
    async fn execution_states_follow_processing_mode() {
        let h = TestHarness::new();
        let dispatched = stuck(&h, TaskState::DispatchedGpu, ProcessingMode::Foreground);
        let background = stuck(&h, TaskState::PythonOrchestrating, ProcessingMode::Background);
        let foreground = stuck(&h, TaskState::PythonOrchestrating, ProcessingMode::Foreground);
        for task in [&dispatched, &background, &foreground] {
            h.insert(task).await.unwrap();
        }
        h.advance_secs(11 * 60);

        let report = h.engine.recover_stale_tasks().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                requalified: 0,
                requeued: 2,
                completed: 1
            }
        );

        let background = h.task(background.id).await.unwrap().unwrap();
        assert_eq!(background.state, TaskState::ReadyForGpu);
        assert!(background.orchestration_started_at.is_none());
        assert_eq!(
            h.task(dispatched.id).await.unwrap().unwrap().state,
            TaskState::ReadyForGpu
        );
        assert_eq!(
            h.task(foreground.id).await.unwrap().unwrap().state,
            TaskState::Completed
        );
    }

    #[tokio::test]
    async fn fresh_tasks_are_left_alone() {
        let h = TestHarness::new();
        let task = stuck(&h, TaskState::Qualifying, ProcessingMode::Background);
        h.insert(&task).await.unwrap();
        h.advance_secs(5 * 60);

        assert_eq!(h.engine.recover_stale_tasks().await.unwrap().total(), 0);
        assert_eq!(h.task(task.id).await.unwrap().unwrap().state, TaskState::Qualifying);
    }
}
