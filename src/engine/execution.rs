//! Execution loop: single-slot dispatch to the expensive backend.
//!
//! Each tick, in order:
//! 1. preempt running BACKGROUND work if interactive activity is recent
//! 2. requeue executions that stopped sending any signal
//! 3. dispatch at most one task, FOREGROUND first
//!
//! Admission control is layered: a cheap count of `PYTHON_ORCHESTRATING`
//! tasks in the store, this process's size-1 permit, and finally the
//! backend's own answer (`Busy`).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::TaskOrchestrationEngine;
use crate::clock::to_chrono;
use crate::collaborators::{Acceptance, CompletionReport, PriorityHint};
use crate::error::DatabaseError;
use crate::resilience::RetryFamily;
use crate::store::{CandidateQuery, TaskQueue};
use crate::task::{ProcessingMode, RetryState, Task, TaskPatch, TaskState};

/// Candidates fetched per queue; later ones are tried when a replica wins
/// the claim on earlier ones.
const CLAIM_BATCH: usize = 5;

/// What one execution tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "task_id", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Nothing due in either queue.
    NoCandidate,
    /// Only BACKGROUND work is due and interactive activity is recent.
    BackgroundGated,
    /// An execution is already running.
    Occupied,
    /// Circuit breaker is open.
    CircuitOpen,
    /// Every candidate was claimed by another replica first.
    ClaimLost,
    Accepted(Uuid),
    /// Backend slot taken; retried on the short schedule.
    Busy(Uuid),
    /// Retriable failure; back in `READY_FOR_GPU` with backoff.
    Deferred(Uuid),
    /// Permanent failure; task is in `ERROR`.
    Failed(Uuid),
}

impl TaskOrchestrationEngine {
    /// One tick of the execution loop.
    pub async fn run_execution_cycle(&self) -> Result<DispatchOutcome, DatabaseError> {
        let now = self.clock.now();

        if !self.activity.is_quiet(now, self.config.execution.quiet_period) {
            self.preempt_background().await?;
        }
        self.check_liveness().await?;
        self.prune_busy_streaks().await;

        if !self.breaker.allows_call(now) {
            debug!("Execution backend circuit open, skipping dispatch");
            return Ok(DispatchOutcome::CircuitOpen);
        }

        if self.store.count_by_state(TaskState::PythonOrchestrating).await? >= 1 {
            return Ok(DispatchOutcome::Occupied);
        }
        let Ok(_permit) = self.dispatch_permit.try_acquire() else {
            return Ok(DispatchOutcome::Occupied);
        };

        let candidates = self.next_candidates(now).await?;
        let candidates = match candidates {
            Some(c) => c,
            None => return Ok(DispatchOutcome::BackgroundGated),
        };
        if candidates.is_empty() {
            return Ok(DispatchOutcome::NoCandidate);
        }

        for task in candidates {
            let claimed = self
                .store
                .conditional_update(
                    task.id,
                    TaskState::ReadyForGpu,
                    TaskState::DispatchedGpu,
                    &TaskPatch::new(),
                    self.clock.now(),
                )
                .await?;
            if claimed {
                return self.dispatch(task).await;
            }
            debug!(task_id = %task.id, "Lost dispatch claim to another replica");
        }
        Ok(DispatchOutcome::ClaimLost)
    }

    /// FOREGROUND candidates if any; otherwise BACKGROUND candidates when
    /// the quiet period has elapsed. `None` means background is gated.
    async fn next_candidates(&self, now: DateTime<Utc>) -> Result<Option<Vec<Task>>, DatabaseError> {
        let foreground = self
            .store
            .get_candidates(&CandidateQuery::new(
                TaskQueue::Execution(ProcessingMode::Foreground),
                now,
                CLAIM_BATCH,
            ))
            .await?;
        if !foreground.is_empty() {
            return Ok(Some(foreground));
        }

        let background = self
            .store
            .get_candidates(&CandidateQuery::new(
                TaskQueue::Execution(ProcessingMode::Background),
                now,
                CLAIM_BATCH,
            ))
            .await?;
        if !background.is_empty() && !self.activity.is_quiet(now, self.config.execution.quiet_period) {
            debug!(waiting = background.len(), "Background dispatch gated by recent activity");
            return Ok(None);
        }
        Ok(Some(background))
    }

    /// Prepare, call the backend and record the answer for a claimed task.
    async fn dispatch(&self, task: Task) -> Result<DispatchOutcome, DatabaseError> {
        if let Err(e) = self.workspace.prepare(&task).await {
            let now = self.clock.now();
            if e.retriable {
                let attempt = task.workspace_retry.retry_count.saturating_add(1);
                let delay = self.retry.delay(RetryFamily::Workspace, attempt);
                warn!(
                    task_id = %task.id,
                    attempt,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Workspace preparation failed, will retry"
                );
                let patch = TaskPatch::new()
                    .workspace_retry(task.workspace_retry.after_failure(e.message, delay, now));
                self.release(&task, TaskState::ReadyForGpu, &patch).await?;
                return Ok(DispatchOutcome::Deferred(task.id));
            }
            warn!(task_id = %task.id, error = %e, "Workspace preparation failed permanently");
            let patch = TaskPatch::new().result(Some(e.to_string()));
            self.release(&task, TaskState::Error, &patch).await?;
            return Ok(DispatchOutcome::Failed(task.id));
        }

        let answer = self
            .backend
            .accept(&task, PriorityHint::from(task.processing_mode))
            .await;
        let now = self.clock.now();

        match answer {
            Ok(Acceptance::Accepted) => {
                self.breaker.record_success();
                self.clear_busy_streak(task.id);
                let patch = TaskPatch::new()
                    .orchestration_started_at(Some(now))
                    .dispatch_retry(RetryState::default())
                    .workspace_retry(RetryState::default());
                let marked = self
                    .store
                    .conditional_update(
                        task.id,
                        TaskState::DispatchedGpu,
                        TaskState::PythonOrchestrating,
                        &patch,
                        now,
                    )
                    .await?;
                if !marked {
                    warn!(task_id = %task.id, "Accepted task was moved before it could be marked running");
                }
                info!(
                    task_id = %task.id,
                    mode = %task.processing_mode,
                    task_type = %task.task_type,
                    "Task accepted for execution"
                );
                Ok(DispatchOutcome::Accepted(task.id))
            }
            Ok(Acceptance::Busy) => {
                let streak = self.bump_busy_streak(task.id);
                let delay = self.retry.delay(RetryFamily::Dispatch, streak);
                debug!(
                    task_id = %task.id,
                    streak,
                    retry_in_secs = delay.as_secs(),
                    "Execution backend busy"
                );
                let patch = TaskPatch::new().dispatch_retry(task.dispatch_retry.deferred(delay, now));
                self.release(&task, TaskState::ReadyForGpu, &patch).await?;
                Ok(DispatchOutcome::Busy(task.id))
            }
            Ok(Acceptance::Unavailable(reason)) => {
                self.retry_dispatch(&task, format!("backend unavailable: {reason}"), now)
                    .await
            }
            Err(e) if e.is_retriable() => self.retry_dispatch(&task, e.to_string(), now).await,
            Err(e) => {
                self.clear_busy_streak(task.id);
                warn!(task_id = %task.id, error = %e, "Execution backend rejected task");
                let patch = TaskPatch::new().result(Some(e.to_string()));
                self.release(&task, TaskState::Error, &patch).await?;
                Ok(DispatchOutcome::Failed(task.id))
            }
        }
    }

    /// Transport-level failure: counts against the breaker and the task's
    /// dispatch retries.
    async fn retry_dispatch(
        &self,
        task: &Task,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DatabaseError> {
        self.breaker.record_failure(now);
        let attempt = task.dispatch_retry.retry_count.saturating_add(1);
        let delay = self.retry.delay(RetryFamily::Dispatch, attempt);
        warn!(
            task_id = %task.id,
            attempt,
            retry_in_secs = delay.as_secs(),
            error = %error,
            "Dispatch failed, will retry"
        );
        let patch = TaskPatch::new().dispatch_retry(task.dispatch_retry.after_failure(error, delay, now));
        self.release(task, TaskState::ReadyForGpu, &patch).await?;
        Ok(DispatchOutcome::Deferred(task.id))
    }

    /// Move a claimed task out of `DISPATCHED_GPU`.
    async fn release(&self, task: &Task, to: TaskState, patch: &TaskPatch) -> Result<(), DatabaseError> {
        let moved = self
            .store
            .conditional_update(task.id, TaskState::DispatchedGpu, to, patch, self.clock.now())
            .await?;
        if !moved {
            warn!(task_id = %task.id, to = %to, "Dispatched task changed state before release");
        }
        if to != TaskState::ReadyForGpu {
            self.clear_busy_streak(task.id);
        }
        Ok(())
    }

    fn bump_busy_streak(&self, task_id: Uuid) -> u32 {
        let mut streaks = self.busy_streaks.lock().unwrap_or_else(|e| e.into_inner());
        let streak = streaks.entry(task_id).or_insert(0);
        *streak = streak.saturating_add(1);
        *streak
    }

    fn clear_busy_streak(&self, task_id: Uuid) {
        self.busy_streaks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }

    /// Drop streaks of tasks that left the dispatch queue without passing
    /// through this engine, e.g. dispatched by another replica.
    async fn prune_busy_streaks(&self) {
        let tracked: Vec<Uuid> = self
            .busy_streaks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();

        for task_id in tracked {
            match self.store.get_task(task_id).await {
                Ok(Some(task))
                    if matches!(task.state, TaskState::ReadyForGpu | TaskState::DispatchedGpu) => {}
                Ok(_) => self.clear_busy_streak(task_id),
                Err(e) => debug!(task_id = %task_id, error = %e, "Could not check busy streak"),
            }
        }
    }

    // ── Preemption ──────────────────────────────────────────────────

    /// Cancel every running BACKGROUND execution and return it to
    /// `READY_FOR_GPU` without touching its retry counters.
    ///
    /// Returns how many were preempted.
    pub async fn preempt_background(&self) -> Result<usize, DatabaseError> {
        let running = self.store.list_by_state(TaskState::PythonOrchestrating).await?;
        let mut preempted = 0;

        for task in running
            .into_iter()
            .filter(|t| t.processing_mode == ProcessingMode::Background)
        {
            if let Err(e) = self.backend.cancel(task.id).await {
                warn!(task_id = %task.id, error = %e, "Failed to cancel background execution");
                continue;
            }
            // The backend may also report the interruption; the second
            // report finds the task already requeued and is ignored.
            match self.handle_completion(CompletionReport::preempted(task.id)).await {
                Ok(effect) => {
                    info!(task_id = %task.id, effect = ?effect, "Background execution preempted");
                    preempted += 1;
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Failed to requeue preempted execution");
                }
            }
        }
        Ok(preempted)
    }

    // ── Liveness ────────────────────────────────────────────────────

    /// Requeue executions with no heartbeat, update or start time within
    /// the liveness threshold.
    ///
    /// Returns how many were requeued.
    pub async fn check_liveness(&self) -> Result<usize, DatabaseError> {
        let now = self.clock.now();
        let threshold = to_chrono(self.config.execution.liveness_threshold);
        let running = self.store.list_by_state(TaskState::PythonOrchestrating).await?;
        self.heartbeats
            .retain(|task_id| running.iter().any(|t| t.id == task_id));
        let mut requeued = 0;

        for task in running {
            let last_signal = [
                self.heartbeats.last_seen(task.id),
                Some(task.updated_at),
                task.orchestration_started_at,
            ]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(task.updated_at);

            if now - last_signal <= threshold {
                continue;
            }

            let silent_for = (now - last_signal).to_std().unwrap_or(Duration::ZERO);
            warn!(
                task_id = %task.id,
                silent_secs = silent_for.as_secs(),
                "Execution stopped signalling, requeueing"
            );
            if let Err(e) = self.backend.cancel(task.id).await {
                debug!(task_id = %task.id, error = %e, "Best-effort cancel of dead execution failed");
            }

            let attempt = task.dispatch_retry.retry_count.saturating_add(1);
            let delay = self.retry.delay(RetryFamily::Dispatch, attempt);
            let patch = TaskPatch::new()
                .orchestration_started_at(None)
                .dispatch_retry(task.dispatch_retry.after_failure(
                    format!("no execution signal for {}s", silent_for.as_secs()),
                    delay,
                    now,
                ));
            match self
                .store
                .conditional_update(
                    task.id,
                    TaskState::PythonOrchestrating,
                    TaskState::ReadyForGpu,
                    &patch,
                    now,
                )
                .await
            {
                Ok(true) => {
                    self.heartbeats.forget(task.id);
                    requeued += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to requeue dead execution"),
            }
        }
        Ok(requeued)
    }
}

/// Spawn the execution loop.
pub(crate) fn spawn_execution_loop(engine: Arc<TaskOrchestrationEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = engine.config.execution.poll_interval;
        info!("Execution loop started (interval: {}s)", interval.as_secs());

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match engine.run_execution_cycle().await {
                Ok(DispatchOutcome::NoCandidate | DispatchOutcome::Occupied) => {}
                Ok(outcome) => debug!(outcome = ?outcome, "Execution tick"),
                Err(e) => warn!(error = %e, "Execution tick failed"),
            }
        }
    })
}

/// Spawn the watcher that preempts background work as soon as interactive
/// activity is recorded.
pub(crate) fn spawn_preemption_watcher(engine: Arc<TaskOrchestrationEngine>) -> JoinHandle<()> {
    let mut rx = engine.activity.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    if let Err(e) = engine.preempt_background().await {
                        warn!(error = %e, "Preemption failed");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExecutionError, WorkspaceError};
    use crate::testing::{FailingStore, TestHarness};
    use serde_json::json;

    fn ready(h: &TestHarness, mode: ProcessingMode) -> Task {
        Task::new("doc", mode, json!({}), h.clock.now()).with_state(TaskState::ReadyForGpu)
    }

    #[tokio::test]
    async fn accepted_task_is_marked_running() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Foreground);
        h.insert(&task).await.unwrap();

        let outcome = h.engine.run_execution_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Accepted(task.id));

        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::PythonOrchestrating);
        assert_eq!(stored.orchestration_started_at, Some(h.clock.now()));
        assert_eq!(h.backend.priorities(), vec![(task.id, PriorityHint::Interactive)]);
    }

    #[tokio::test]
    async fn foreground_goes_before_older_background() {
        let h = TestHarness::new();
        let bg = ready(&h, ProcessingMode::Background);
        h.insert(&bg).await.unwrap();
        h.advance_secs(60);
        let fg = ready(&h, ProcessingMode::Foreground);
        h.insert(&fg).await.unwrap();

        let outcome = h.engine.run_execution_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Accepted(fg.id));
    }

    #[tokio::test]
    async fn second_dispatch_waits_for_running_execution() {
        let h = TestHarness::new();
        let first = ready(&h, ProcessingMode::Foreground);
        let second = ready(&h, ProcessingMode::Foreground);
        h.insert(&first).await.unwrap();
        h.insert(&second).await.unwrap();

        h.engine.run_execution_cycle().await.unwrap();
        let outcome = h.engine.run_execution_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Occupied);
        assert_eq!(h.task(second.id).await.unwrap().unwrap().state, TaskState::ReadyForGpu);
    }

    #[tokio::test]
    async fn busy_escalates_without_persisted_counter() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Foreground);
        h.insert(&task).await.unwrap();

        h.backend.push(Ok(Acceptance::Busy));
        h.backend.push(Ok(Acceptance::Busy));

        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Busy(task.id));
        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::ReadyForGpu);
        assert_eq!(stored.dispatch_retry.retry_count, 0);
        assert_eq!(
            stored.dispatch_retry.next_retry_at,
            Some(h.clock.now() + chrono::Duration::seconds(5))
        );

        h.advance_secs(5);
        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Busy(task.id));
        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.dispatch_retry.retry_count, 0);
        assert_eq!(
            stored.dispatch_retry.next_retry_at,
            Some(h.clock.now() + chrono::Duration::seconds(15))
        );
        // Busy is a healthy answer
        assert_eq!(h.engine.circuit_breaker().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn unavailable_counts_against_breaker_and_retry() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Foreground);
        h.insert(&task).await.unwrap();
        h.backend.push(Ok(Acceptance::Unavailable("warming up".into())));

        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Deferred(task.id));
        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.dispatch_retry.retry_count, 1);
        assert!(stored.dispatch_retry.last_error.unwrap().contains("warming up"));
        assert_eq!(h.engine.circuit_breaker().consecutive_failures(), 1);

        // Not due yet
        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::NoCandidate);
    }

    #[tokio::test]
    async fn rejection_is_permanent() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Foreground);
        h.insert(&task).await.unwrap();
        h.backend.push(Err(ExecutionError::Rejected("unsupported task".into())));

        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Failed(task.id));
        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Error);
        assert!(stored.result.unwrap().contains("unsupported task"));
    }

    #[tokio::test]
    async fn open_circuit_skips_dispatch() {
        let mut config = crate::config::OrchestratorConfig::default();
        config.circuit_breaker.failure_threshold = 1;
        let h = TestHarness::with_config(config);
        let task = ready(&h, ProcessingMode::Foreground);
        h.insert(&task).await.unwrap();
        h.backend.push(Err(ExecutionError::Transport("connection refused".into())));

        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Deferred(task.id));
        h.advance_secs(5);
        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::CircuitOpen);

        h.advance_secs(60);
        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Accepted(task.id));
    }

    #[tokio::test]
    async fn workspace_failure_uses_its_own_retry() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Foreground);
        h.insert(&task).await.unwrap();
        h.workspace.push(Err(WorkspaceError::retriable("checkout failed")));

        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Deferred(task.id));
        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.workspace_retry.retry_count, 1);
        assert_eq!(stored.dispatch_retry.retry_count, 0);
        assert!(h.backend.priorities().is_empty());

        h.advance_secs(15);
        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Accepted(task.id));
        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.workspace_retry, RetryState::default());
    }

    #[tokio::test]
    async fn background_waits_for_quiet_period() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Background);
        h.insert(&task).await.unwrap();
        h.engine.notify_interactive_start();

        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::BackgroundGated);
        h.advance_secs(30);
        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Accepted(task.id));
        assert_eq!(h.backend.priorities(), vec![(task.id, PriorityHint::Background)]);
    }

    #[tokio::test]
    async fn activity_preempts_running_background() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Background);
        h.insert(&task).await.unwrap();
        h.engine.run_execution_cycle().await.unwrap();

        h.engine.notify_interactive_start();
        let preempted = h.engine.preempt_background().await.unwrap();
        assert_eq!(preempted, 1);
        assert_eq!(h.backend.cancelled(), vec![task.id]);

        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::ReadyForGpu);
        assert_eq!(stored.dispatch_retry.retry_count, 0);
        assert!(stored.orchestration_started_at.is_none());
    }

    #[tokio::test]
    async fn foreground_execution_is_never_preempted() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Foreground);
        h.insert(&task).await.unwrap();
        h.engine.run_execution_cycle().await.unwrap();

        h.engine.notify_interactive_start();
        assert_eq!(h.engine.preempt_background().await.unwrap(), 0);
        assert!(h.backend.cancelled().is_empty());
    }

    #[tokio::test]
    async fn failed_cancel_leaves_task_running() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Background);
        h.insert(&task).await.unwrap();
        h.engine.run_execution_cycle().await.unwrap();
        h.backend.set_fail_cancel(true);

        h.engine.notify_interactive_start();
        assert_eq!(h.engine.preempt_background().await.unwrap(), 0);
        assert_eq!(
            h.task(task.id).await.unwrap().unwrap().state,
            TaskState::PythonOrchestrating
        );
    }

    #[tokio::test]
    async fn preemption_continues_past_a_failed_requeue() {
        let h = TestHarness::new();
        let first = ready(&h, ProcessingMode::Background).with_state(TaskState::PythonOrchestrating);
        let second = ready(&h, ProcessingMode::Background).with_state(TaskState::PythonOrchestrating);
        h.insert(&first).await.unwrap();
        h.insert(&second).await.unwrap();

        let store = Arc::new(FailingStore::new(h.store.clone(), 1));
        let engine = h.engine_on(store.clone());
        engine.notify_interactive_start();

        assert_eq!(engine.preempt_background().await.unwrap(), 1);
        assert_eq!(store.failures(), 1);
        assert_eq!(h.backend.cancelled().len(), 2);

        let mut states = vec![
            h.task(first.id).await.unwrap().unwrap().state,
            h.task(second.id).await.unwrap().unwrap().state,
        ];
        states.sort_by_key(|s| s.to_string());
        assert_eq!(states, vec![TaskState::PythonOrchestrating, TaskState::ReadyForGpu]);
    }

    #[tokio::test]
    async fn busy_streak_is_dropped_when_task_leaves_queue() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Foreground);
        h.insert(&task).await.unwrap();
        h.backend.push(Ok(Acceptance::Busy));

        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Busy(task.id));
        assert!(h.engine.busy_streaks.lock().unwrap().contains_key(&task.id));

        // Another replica gets the slot once the backoff has passed
        h.advance_secs(5);
        let other = h.replica();
        assert_eq!(other.run_execution_cycle().await.unwrap(), DispatchOutcome::Accepted(task.id));

        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Occupied);
        assert!(h.engine.busy_streaks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn busy_streak_is_dropped_on_permanent_workspace_failure() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Foreground);
        h.insert(&task).await.unwrap();
        h.backend.push(Ok(Acceptance::Busy));
        h.engine.run_execution_cycle().await.unwrap();

        h.advance_secs(5);
        h.workspace.push(Err(WorkspaceError::permanent("repository gone")));
        assert_eq!(h.engine.run_execution_cycle().await.unwrap(), DispatchOutcome::Failed(task.id));
        assert!(h.engine.busy_streaks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeats_of_tasks_finished_elsewhere_are_dropped() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Foreground);
        h.insert(&task).await.unwrap();
        h.engine.run_execution_cycle().await.unwrap();
        assert!(h.engine.record_heartbeat(task.id, None).await.unwrap());
        assert_eq!(h.engine.heartbeats().tracked(), 1);

        h.replica()
            .handle_completion(CompletionReport::done(task.id))
            .await
            .unwrap();
        h.engine.check_liveness().await.unwrap();
        assert_eq!(h.engine.heartbeats().tracked(), 0);
    }

    #[tokio::test]
    async fn silent_execution_is_requeued() {
        let h = TestHarness::new();
        let task = ready(&h, ProcessingMode::Foreground);
        h.insert(&task).await.unwrap();
        h.engine.run_execution_cycle().await.unwrap();

        h.advance_secs(20 * 60);
        assert!(h.engine.record_heartbeat(task.id, Some("halfway".into())).await.unwrap());
        h.advance_secs(20 * 60);
        assert_eq!(h.engine.check_liveness().await.unwrap(), 0);

        h.advance_secs(11 * 60);
        assert_eq!(h.engine.check_liveness().await.unwrap(), 1);
        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::ReadyForGpu);
        assert_eq!(stored.dispatch_retry.retry_count, 1);
        assert!(stored.orchestration_started_at.is_none());
        assert_eq!(h.backend.cancelled(), vec![task.id]);
    }
}
