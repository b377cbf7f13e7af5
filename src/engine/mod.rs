//! Task orchestration engine.
//!
//! Composes the polling loops around one shared `TaskStore`:
//! - **qualification**: cheap classification, bounded fan-out
//! - **scheduler**: promotes due one-shot and cron tasks
//! - **execution**: single-slot dispatch to the expensive backend, with
//!   preemption of background work and a liveness watchdog
//! - **idle review**: optional synthetic task when nothing is in flight
//!
//! Recovery runs once in `start()` before any loop. Every state change goes
//! through `TaskStore::conditional_update`, so several engines may share a
//! store.

pub mod completion;
pub mod execution;
pub mod idle_review;
pub mod qualification;
pub mod recovery;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::activity::ActivitySignal;
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{ExecutionBackend, NoopWorkspacePreparer, Qualifier, WorkspacePreparer};
use crate::config::OrchestratorConfig;
use crate::error::{DatabaseError, Result, TaskError};
use crate::heartbeat::HeartbeatTracker;
use crate::resilience::{BackoffPolicy, CircuitBreaker, RetryPolicies};
use crate::store::TaskStore;
use crate::task::{TaskPatch, TaskState};

pub use completion::CompletionEffect;
pub use execution::DispatchOutcome;
pub use recovery::RecoveryReport;

/// Collaborators the engine is wired to.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn TaskStore>,
    pub qualifier: Arc<dyn Qualifier>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub workspace: Arc<dyn WorkspacePreparer>,
    pub clock: Arc<dyn Clock>,
    pub activity: Arc<ActivitySignal>,
}

impl EngineDeps {
    /// Wall clock, no-op workspace preparation, fresh activity signal.
    pub fn new(
        store: Arc<dyn TaskStore>,
        qualifier: Arc<dyn Qualifier>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Self {
        Self {
            store,
            qualifier,
            backend,
            workspace: Arc::new(NoopWorkspacePreparer),
            clock: Arc::new(SystemClock),
            activity: Arc::new(ActivitySignal::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_workspace(mut self, workspace: Arc<dyn WorkspacePreparer>) -> Self {
        self.workspace = workspace;
        self
    }

    /// Share an activity signal, e.g. with the request-intake path.
    pub fn with_activity(mut self, activity: Arc<ActivitySignal>) -> Self {
        self.activity = activity;
        self
    }
}

/// Join handles of the running loops.
pub struct EngineHandles {
    pub qualification: JoinHandle<()>,
    pub scheduler: JoinHandle<()>,
    pub execution: JoinHandle<()>,
    pub preemption: JoinHandle<()>,
    pub idle_review: Option<JoinHandle<()>>,
}

impl EngineHandles {
    /// Stop every loop. In-flight tasks are left for recovery.
    pub fn abort(&self) {
        self.qualification.abort();
        self.scheduler.abort();
        self.execution.abort();
        self.preemption.abort();
        if let Some(handle) = &self.idle_review {
            handle.abort();
        }
    }
}

pub struct TaskOrchestrationEngine {
    config: OrchestratorConfig,
    store: Arc<dyn TaskStore>,
    qualifier: Arc<dyn Qualifier>,
    backend: Arc<dyn ExecutionBackend>,
    workspace: Arc<dyn WorkspacePreparer>,
    clock: Arc<dyn Clock>,
    activity: Arc<ActivitySignal>,
    heartbeats: HeartbeatTracker,
    retry: RetryPolicies,
    breaker: CircuitBreaker,
    /// Single expensive-execution slot for this process. Only ever
    /// `try_acquire`d.
    dispatch_permit: Semaphore,
    /// Consecutive busy answers per task. Not persisted.
    busy_streaks: Mutex<HashMap<Uuid, u32>>,
}

impl TaskOrchestrationEngine {
    pub fn new(config: OrchestratorConfig, deps: EngineDeps) -> Self {
        let retry = RetryPolicies {
            qualification: BackoffPolicy::from(&config.backoff.qualification),
            dispatch: BackoffPolicy::from(&config.backoff.dispatch),
            workspace: BackoffPolicy::from(&config.backoff.workspace),
        };
        let breaker = CircuitBreaker::new("execution_backend", &config.circuit_breaker);

        Self {
            config,
            store: deps.store,
            qualifier: deps.qualifier,
            backend: deps.backend,
            workspace: deps.workspace,
            clock: deps.clock,
            activity: deps.activity,
            heartbeats: HeartbeatTracker::new(),
            retry,
            breaker,
            dispatch_permit: Semaphore::new(1),
            busy_streaks: Mutex::new(HashMap::new()),
        }
    }

    /// Recover stale tasks, then spawn every loop.
    pub async fn start(self: &Arc<Self>) -> std::result::Result<EngineHandles, DatabaseError> {
        let report = self.recover_stale_tasks().await?;
        info!(
            requalified = report.requalified,
            requeued = report.requeued,
            completed = report.completed,
            "Startup recovery finished"
        );

        let idle_review = self
            .config
            .idle_review
            .enabled
            .then(|| idle_review::spawn_idle_review_loop(Arc::clone(self)));

        Ok(EngineHandles {
            qualification: qualification::spawn_qualification_loop(Arc::clone(self)),
            scheduler: scheduler::spawn_scheduler_loop(Arc::clone(self)),
            execution: execution::spawn_execution_loop(Arc::clone(self)),
            preemption: execution::spawn_preemption_watcher(Arc::clone(self)),
            idle_review,
        })
    }

    // ── Inbound ports ───────────────────────────────────────────────

    /// Called by the request-intake path when an interactive request starts.
    pub fn notify_interactive_start(&self) {
        self.activity.record_activity(self.clock.now());
    }

    /// Heartbeat/progress ingest for a running execution.
    ///
    /// Returns `false` when the task is not executing. Also touches the
    /// task's `updated_at` so a restart does not mistake it for stale.
    pub async fn record_heartbeat(
        &self,
        task_id: Uuid,
        progress: Option<String>,
    ) -> std::result::Result<bool, DatabaseError> {
        let now = self.clock.now();
        let touched = self
            .store
            .conditional_update(
                task_id,
                TaskState::PythonOrchestrating,
                TaskState::PythonOrchestrating,
                &TaskPatch::new(),
                now,
            )
            .await?;
        if touched {
            self.heartbeats.record(task_id, now, progress);
        } else {
            debug!(task_id = %task_id, "Heartbeat for task not in execution ignored");
        }
        Ok(touched)
    }

    /// A human answered the question of a `USER_TASK`; queue it for
    /// execution again with the answer in the payload.
    pub async fn respond_to_user_task(&self, task_id: Uuid, response: String) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;
        if task.state != TaskState::UserTask {
            return Err(TaskError::UnexpectedState {
                id: task_id,
                state: task.state,
                expected: TaskState::UserTask,
            }
            .into());
        }

        let payload = with_user_response(task.payload, response);
        let patch = TaskPatch::new()
            .payload(payload)
            .orchestration_started_at(None);
        let moved = self
            .store
            .conditional_update(
                task_id,
                TaskState::UserTask,
                TaskState::ReadyForGpu,
                &patch,
                self.clock.now(),
            )
            .await?;
        if !moved {
            let state = self
                .store
                .get_task(task_id)
                .await?
                .map(|t| t.state)
                .ok_or(TaskError::NotFound { id: task_id })?;
            return Err(TaskError::UnexpectedState {
                id: task_id,
                state,
                expected: TaskState::UserTask,
            }
            .into());
        }

        info!(task_id = %task_id, "User responded, task requeued for execution");
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn activity(&self) -> &Arc<ActivitySignal> {
        &self.activity
    }

    pub fn heartbeats(&self) -> &HeartbeatTracker {
        &self.heartbeats
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Store a user's answer under `user_response`, wrapping non-object payloads.
fn with_user_response(payload: Value, response: String) -> Value {
    match payload {
        Value::Object(mut map) => {
            map.insert("user_response".to_string(), Value::String(response));
            Value::Object(map)
        }
        Value::Null => serde_json::json!({ "user_response": response }),
        other => serde_json::json!({ "input": other, "user_response": response }),
    }
}
