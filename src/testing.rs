//! Fakes for exercising the engine without a reasoning service.
//!
//! Used by the unit tests, the `tests/` integration suite, and by embedders
//! who want to drive the engine deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::clock::ManualClock;
use crate::collaborators::{
    Acceptance, ExecutionBackend, PriorityHint, Qualification, Qualifier, WorkspacePreparer,
};
use crate::config::OrchestratorConfig;
use crate::engine::{EngineDeps, TaskOrchestrationEngine};
use crate::error::{DatabaseError, ExecutionError, QualificationError, WorkspaceError};
use crate::store::{CandidateQuery, InMemoryTaskStore, TaskStore};
use crate::task::{Task, TaskPatch, TaskState};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A fixed, readable starting instant for manual clocks.
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

// ── Qualifier ───────────────────────────────────────────────────────

/// Qualifier that replays scripted answers, then falls back to a default.
pub struct ScriptedQualifier {
    script: Mutex<VecDeque<Result<Qualification, QualificationError>>>,
    fallback: Qualification,
    calls: Mutex<Vec<Uuid>>,
}

impl ScriptedQualifier {
    /// Answers `NEEDS_EXPENSIVE_EXECUTION` unless scripted otherwise.
    pub fn new() -> Self {
        Self::with_fallback(Qualification::needs_execution("needs execution"))
    }

    pub fn with_fallback(fallback: Qualification) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, answer: Result<Qualification, QualificationError>) {
        lock(&self.script).push_back(answer);
    }

    /// Task ids in call order.
    pub fn calls(&self) -> Vec<Uuid> {
        lock(&self.calls).clone()
    }
}

impl Default for ScriptedQualifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Qualifier for ScriptedQualifier {
    async fn qualify(&self, task: &Task) -> Result<Qualification, QualificationError> {
        lock(&self.calls).push(task.id);
        let next = lock(&self.script).pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

// ── Execution backend ───────────────────────────────────────────────

#[derive(Default)]
struct BackendState {
    script: VecDeque<Result<Acceptance, ExecutionError>>,
    running: Option<Uuid>,
    accepted: Vec<Uuid>,
    cancelled: Vec<Uuid>,
    priorities: Vec<(Uuid, PriorityHint)>,
    fail_cancel: bool,
}

/// Single-slot execution backend.
///
/// Accepts one task at a time and answers `Busy` while the slot is taken,
/// just like the real service. Scripted answers are replayed first.
/// Share one instance between engines to model several replicas talking to
/// the same backend.
#[derive(Default)]
pub struct FakeExecutionBackend {
    state: Mutex<BackendState>,
}

impl FakeExecutionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, answer: Result<Acceptance, ExecutionError>) {
        lock(&self.state).script.push_back(answer);
    }

    /// Free the slot, as if the execution ended.
    pub fn finish(&self, task_id: Uuid) {
        let mut state = lock(&self.state);
        if state.running == Some(task_id) {
            state.running = None;
        }
    }

    pub fn running(&self) -> Option<Uuid> {
        lock(&self.state).running
    }

    pub fn accepted(&self) -> Vec<Uuid> {
        lock(&self.state).accepted.clone()
    }

    pub fn cancelled(&self) -> Vec<Uuid> {
        lock(&self.state).cancelled.clone()
    }

    pub fn priorities(&self) -> Vec<(Uuid, PriorityHint)> {
        lock(&self.state).priorities.clone()
    }

    /// Make `cancel` fail with a transport error.
    pub fn set_fail_cancel(&self, fail: bool) {
        lock(&self.state).fail_cancel = fail;
    }
}

#[async_trait]
impl ExecutionBackend for FakeExecutionBackend {
    async fn accept(&self, task: &Task, priority: PriorityHint) -> Result<Acceptance, ExecutionError> {
        let mut state = lock(&self.state);
        state.priorities.push((task.id, priority));

        let answer = match state.script.pop_front() {
            Some(answer) => answer,
            None if state.running.is_some() => Ok(Acceptance::Busy),
            None => Ok(Acceptance::Accepted),
        };
        if matches!(answer, Ok(Acceptance::Accepted)) {
            state.running = Some(task.id);
            state.accepted.push(task.id);
        }
        answer
    }

    async fn cancel(&self, task_id: Uuid) -> Result<(), ExecutionError> {
        let mut state = lock(&self.state);
        if state.fail_cancel {
            return Err(ExecutionError::Transport("cancel unreachable".into()));
        }
        state.cancelled.push(task_id);
        if state.running == Some(task_id) {
            state.running = None;
        }
        Ok(())
    }
}

// ── Workspace ───────────────────────────────────────────────────────

/// Workspace preparer replaying scripted results, then succeeding.
#[derive(Default)]
pub struct ScriptedWorkspace {
    script: Mutex<VecDeque<Result<(), WorkspaceError>>>,
    prepared: Mutex<Vec<Uuid>>,
}

impl ScriptedWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: Result<(), WorkspaceError>) {
        lock(&self.script).push_back(result);
    }

    pub fn prepared(&self) -> Vec<Uuid> {
        lock(&self.prepared).clone()
    }
}

#[async_trait]
impl WorkspacePreparer for ScriptedWorkspace {
    async fn prepare(&self, task: &Task) -> Result<(), WorkspaceError> {
        lock(&self.prepared).push(task.id);
        let next = lock(&self.script).pop_front();
        next.unwrap_or(Ok(()))
    }
}

// ── Store ───────────────────────────────────────────────────────────

/// In-memory store whose `n`-th conditional update (1-based) fails with a
/// query error. Every other call goes straight through.
pub struct FailingStore {
    inner: Arc<InMemoryTaskStore>,
    fail_on: usize,
    updates: AtomicUsize,
    failures: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: Arc<InMemoryTaskStore>, fail_on: usize) -> Self {
        Self {
            inner,
            fail_on,
            updates: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// How many updates were failed so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStore for FailingStore {
    async fn insert_task(&self, task: &Task) -> Result<bool, DatabaseError> {
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.inner.get_task(id).await
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.delete_task(id).await
    }

    async fn get_candidates(&self, query: &CandidateQuery) -> Result<Vec<Task>, DatabaseError> {
        self.inner.get_candidates(query).await
    }

    async fn get_due_scheduled(
        &self,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.inner.get_due_scheduled(horizon, limit).await
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected: TaskState,
        new: TaskState,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let call = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(DatabaseError::Query("database is locked".to_string()));
        }
        self.inner
            .conditional_update(id, expected, new, patch, now)
            .await
    }

    async fn count_by_state(&self, state: TaskState) -> Result<u64, DatabaseError> {
        self.inner.count_by_state(state).await
    }

    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>, DatabaseError> {
        self.inner.list_by_state(state).await
    }

    async fn find_stale(
        &self,
        state: TaskState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.inner.find_stale(state, updated_before).await
    }

    async fn count_pending_of_type(&self, task_type: &str) -> Result<u64, DatabaseError> {
        self.inner.count_pending_of_type(task_type).await
    }

    async fn record_message(
        &self,
        subject_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.inner.record_message(subject_id, received_at).await
    }

    async fn message_count_since(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.inner.message_count_since(subject_id, since).await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// An engine wired to in-memory fakes and a manual clock.
pub struct TestHarness {
    pub store: Arc<InMemoryTaskStore>,
    pub clock: Arc<ManualClock>,
    pub qualifier: Arc<ScriptedQualifier>,
    pub backend: Arc<FakeExecutionBackend>,
    pub workspace: Arc<ScriptedWorkspace>,
    pub config: OrchestratorConfig,
    pub engine: Arc<TaskOrchestrationEngine>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let qualifier = Arc::new(ScriptedQualifier::new());
        let backend = Arc::new(FakeExecutionBackend::new());
        let workspace = Arc::new(ScriptedWorkspace::new());

        let engine = build_engine(&config, store.clone(), &clock, &qualifier, &backend, &workspace);
        Self {
            store,
            clock,
            qualifier,
            backend,
            workspace,
            config,
            engine,
        }
    }

    /// Another engine sharing the store, clock and collaborators, with its
    /// own permit, breaker and activity signal (a separate process).
    pub fn replica(&self) -> Arc<TaskOrchestrationEngine> {
        self.engine_on(self.store.clone())
    }

    /// Like `replica`, but over a different store, e.g. one wrapping
    /// `self.store`.
    pub fn engine_on(&self, store: Arc<dyn TaskStore>) -> Arc<TaskOrchestrationEngine> {
        build_engine(
            &self.config,
            store,
            &self.clock,
            &self.qualifier,
            &self.backend,
            &self.workspace,
        )
    }

    pub async fn insert(&self, task: &Task) -> Result<bool, DatabaseError> {
        self.store.insert_task(task).await
    }

    pub async fn task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        self.store.get_task(id).await
    }

    pub fn advance_secs(&self, secs: u64) {
        self.clock.advance(std::time::Duration::from_secs(secs));
    }
}

fn build_engine(
    config: &OrchestratorConfig,
    store: Arc<dyn TaskStore>,
    clock: &Arc<ManualClock>,
    qualifier: &Arc<ScriptedQualifier>,
    backend: &Arc<FakeExecutionBackend>,
    workspace: &Arc<ScriptedWorkspace>,
) -> Arc<TaskOrchestrationEngine> {
    let deps = EngineDeps::new(store, qualifier.clone(), backend.clone())
        .with_clock(clock.clone())
        .with_workspace(workspace.clone());
    Arc::new(TaskOrchestrationEngine::new(config.clone(), deps))
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
