//! Completion callback handling.
//!
//! Maps a `CompletionReport` for a `PYTHON_ORCHESTRATING` task onto its exit
//! edge. Reports for tasks in any other state are ignored, so duplicate or
//! late callbacks are harmless.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::TaskOrchestrationEngine;
use crate::collaborators::{CompletionOutcome, CompletionReport};
use crate::error::DatabaseError;
use crate::resilience::RetryFamily;
use crate::task::{Task, TaskPatch, TaskState};

/// What a completion report did to its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionEffect {
    /// `COMPLETED`.
    Completed,
    /// New messages arrived during execution; back to `READY_FOR_GPU`.
    Requeued,
    /// Retriable error; back to `READY_FOR_GPU` with dispatch backoff.
    Retrying,
    /// Permanent error; `ERROR`.
    Failed,
    /// Waiting for a human in `USER_TASK`.
    AwaitingUser,
    /// Interrupted without a question; back to `READY_FOR_GPU`.
    Preempted,
    /// Task unknown or not executing.
    Ignored,
}

impl TaskOrchestrationEngine {
    /// Apply a completion report.
    pub async fn handle_completion(
        &self,
        report: CompletionReport,
    ) -> Result<CompletionEffect, DatabaseError> {
        let Some(task) = self.store.get_task(report.task_id).await? else {
            debug!(task_id = %report.task_id, "Completion for unknown task ignored");
            return Ok(CompletionEffect::Ignored);
        };
        if task.state != TaskState::PythonOrchestrating {
            debug!(
                task_id = %task.id,
                state = %task.state,
                "Completion for task not in execution ignored"
            );
            return Ok(CompletionEffect::Ignored);
        }

        let effect = match report.outcome {
            CompletionOutcome::Done { details } => self.complete(&task, details).await?,
            CompletionOutcome::Error {
                message,
                retriable: true,
            } => {
                let now = self.clock.now();
                let attempt = task.dispatch_retry.retry_count.saturating_add(1);
                let delay = self.retry.delay(RetryFamily::Dispatch, attempt);
                warn!(
                    task_id = %task.id,
                    attempt,
                    retry_in_secs = delay.as_secs(),
                    error = %message,
                    "Execution failed, will retry"
                );
                let patch = TaskPatch::new()
                    .orchestration_started_at(None)
                    .dispatch_retry(task.dispatch_retry.after_failure(message, delay, now));
                self.leave_execution(&task, TaskState::ReadyForGpu, &patch, CompletionEffect::Retrying)
                    .await?
            }
            CompletionOutcome::Error {
                message,
                retriable: false,
            } => {
                warn!(task_id = %task.id, error = %message, "Execution failed permanently");
                let patch = TaskPatch::new().result(Some(message));
                self.leave_execution(&task, TaskState::Error, &patch, CompletionEffect::Failed)
                    .await?
            }
            CompletionOutcome::Interrupted {
                question: Some(question),
            } => {
                info!(task_id = %task.id, "Execution needs user input");
                let patch = TaskPatch::new().result(Some(question));
                self.leave_execution(&task, TaskState::UserTask, &patch, CompletionEffect::AwaitingUser)
                    .await?
            }
            CompletionOutcome::Interrupted { question: None } => {
                let patch = TaskPatch::new().orchestration_started_at(None);
                self.leave_execution(&task, TaskState::ReadyForGpu, &patch, CompletionEffect::Preempted)
                    .await?
            }
        };

        if effect != CompletionEffect::Ignored {
            self.heartbeats.forget(task.id);
        }
        Ok(effect)
    }

    /// Successful completion, with the auto-requeue check.
    async fn complete(
        &self,
        task: &Task,
        details: Option<String>,
    ) -> Result<CompletionEffect, DatabaseError> {
        let new_messages = match (&task.subject_id, task.orchestration_started_at) {
            (Some(subject), Some(started)) => self.store.message_count_since(subject, started).await?,
            _ => 0,
        };

        if new_messages == 0 {
            info!(task_id = %task.id, task_type = %task.task_type, "Execution completed");
            let patch = TaskPatch::new().result(details);
            return self
                .leave_execution(task, TaskState::Completed, &patch, CompletionEffect::Completed)
                .await;
        }

        // Clear the start marker before requeueing so the next run counts
        // messages from its own start.
        let now = self.clock.now();
        let cleared = self
            .store
            .conditional_update(
                task.id,
                TaskState::PythonOrchestrating,
                TaskState::PythonOrchestrating,
                &TaskPatch::new().orchestration_started_at(None),
                now,
            )
            .await?;
        if !cleared {
            return Ok(CompletionEffect::Ignored);
        }

        info!(
            task_id = %task.id,
            new_messages,
            "Messages arrived during execution, requeueing"
        );
        let patch = TaskPatch::new().result(details);
        self.leave_execution(task, TaskState::ReadyForGpu, &patch, CompletionEffect::Requeued)
            .await
    }

    async fn leave_execution(
        &self,
        task: &Task,
        to: TaskState,
        patch: &TaskPatch,
        effect: CompletionEffect,
    ) -> Result<CompletionEffect, DatabaseError> {
        let moved = self
            .store
            .conditional_update(task.id, TaskState::PythonOrchestrating, to, patch, self.clock.now())
            .await?;
        if moved {
            Ok(effect)
        } else {
            debug!(task_id = %task.id, "Task left execution concurrently, completion ignored");
            Ok(CompletionEffect::Ignored)
        }
    }
}
