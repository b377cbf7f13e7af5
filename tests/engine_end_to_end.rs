//! End-to-end runs of the engine against in-memory and libSQL stores.
//!
//! The engine is driven tick by tick with a manual clock, except for the
//! preemption test, which runs the real loops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde_json::json;
use tokio::time::timeout;

use ai_orchestrator::clock::ManualClock;
use ai_orchestrator::collaborators::{Acceptance, CompletionReport};
use ai_orchestrator::config::OrchestratorConfig;
use ai_orchestrator::engine::{CompletionEffect, DispatchOutcome, EngineDeps, TaskOrchestrationEngine};
use ai_orchestrator::store::{LibSqlTaskStore, TaskStore};
use ai_orchestrator::task::{ProcessingMode, RetryState, Task, TaskState};
use ai_orchestrator::testing::{FakeExecutionBackend, ScriptedQualifier, TestHarness, start_time};

/// Maximum time a test waits on the live loops.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn background_task_survives_unavailable_backend_and_completes() {
    let h = TestHarness::new();
    let task = Task::new(
        "DOCUMENT",
        ProcessingMode::Background,
        json!({"path": "contract.pdf"}),
        h.clock.now(),
    )
    .with_state(TaskState::ReadyForQualification);
    h.insert(&task).await.unwrap();

    // Qualification routes it to expensive execution
    assert_eq!(h.engine.run_qualification_cycle().await.unwrap(), 1);
    assert_eq!(h.task(task.id).await.unwrap().unwrap().state, TaskState::ReadyForGpu);

    for _ in 0..3 {
        h.backend.push(Ok(Acceptance::Unavailable("model loading".into())));
    }

    for (attempt, wait) in [(1u32, 5i64), (2, 15), (3, 30)] {
        let outcome = h.engine.run_execution_cycle().await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Deferred(task.id));

        let stored = h.task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TaskState::ReadyForGpu);
        assert_eq!(stored.dispatch_retry.retry_count, attempt);
        assert_eq!(
            stored.dispatch_retry.next_retry_at,
            Some(h.clock.now() + ChronoDuration::seconds(wait))
        );

        // Nothing happens until the backoff has elapsed
        assert_eq!(
            h.engine.run_execution_cycle().await.unwrap(),
            DispatchOutcome::NoCandidate
        );
        h.advance_secs(wait as u64);
    }

    assert_eq!(
        h.engine.run_execution_cycle().await.unwrap(),
        DispatchOutcome::Accepted(task.id)
    );
    let running = h.task(task.id).await.unwrap().unwrap();
    assert_eq!(running.state, TaskState::PythonOrchestrating);
    assert_eq!(running.dispatch_retry, RetryState::default());

    let effect = h
        .engine
        .handle_completion(CompletionReport::done(task.id))
        .await
        .unwrap();
    assert_eq!(effect, CompletionEffect::Completed);
    assert_eq!(h.task(task.id).await.unwrap().unwrap().state, TaskState::Completed);

    let path: Vec<(TaskState, TaskState)> = h
        .store
        .history()
        .await
        .into_iter()
        .map(|r| (r.from, r.to))
        .collect();
    assert_eq!(
        path.first(),
        Some(&(TaskState::ReadyForQualification, TaskState::Qualifying))
    );
    assert_eq!(
        path.last(),
        Some(&(TaskState::PythonOrchestrating, TaskState::Completed))
    );
}

#[tokio::test]
async fn completion_with_new_messages_requeues_and_reruns() {
    let h = TestHarness::new();
    let task = Task::new("USER_MESSAGE", ProcessingMode::Foreground, json!({}), h.clock.now())
        .with_state(TaskState::ReadyForGpu)
        .with_subject("chat-42");
    h.insert(&task).await.unwrap();
    h.engine.run_execution_cycle().await.unwrap();

    h.advance_secs(3);
    h.store.record_message("chat-42", h.clock.now()).await.unwrap();
    h.store.record_message("chat-42", h.clock.now()).await.unwrap();

    let effect = h
        .engine
        .handle_completion(CompletionReport::done(task.id))
        .await
        .unwrap();
    assert_eq!(effect, CompletionEffect::Requeued);
    h.backend.finish(task.id);

    let stored = h.task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::ReadyForGpu);
    assert!(stored.orchestration_started_at.is_none());

    // The rerun only counts messages from its own start
    h.advance_secs(1);
    assert_eq!(
        h.engine.run_execution_cycle().await.unwrap(),
        DispatchOutcome::Accepted(task.id)
    );
    h.advance_secs(10);
    assert_eq!(
        h.engine
            .handle_completion(CompletionReport::done(task.id))
            .await
            .unwrap(),
        CompletionEffect::Completed
    );
}

#[tokio::test]
async fn recurring_task_runs_each_occurrence_once() {
    let h = TestHarness::new();
    let first_run = h.clock.now();
    let digest = Task::new("DIGEST", ProcessingMode::Background, json!({}), first_run)
        .with_correlation_id("morning-digest")
        .with_schedule(first_run, Some("0 9 * * *".into()));
    h.insert(&digest).await.unwrap();

    assert_eq!(h.engine.run_scheduler_cycle().await.unwrap(), 1);
    let next = h.task(digest.id).await.unwrap().unwrap().scheduled_at.unwrap();
    assert!(next > first_run);

    // Jump to the next occurrence; exactly one more copy appears
    h.clock.set(next);
    assert_eq!(h.engine.run_scheduler_cycle().await.unwrap(), 1);
    assert_eq!(h.replica().run_scheduler_cycle().await.unwrap(), 0);
    assert_eq!(
        h.store
            .count_by_state(TaskState::ReadyForQualification)
            .await
            .unwrap(),
        2
    );
    assert!(h.task(digest.id).await.unwrap().unwrap().scheduled_at.unwrap() > next);
}

#[tokio::test]
async fn running_loops_preempt_background_on_interactive_request() {
    let h = TestHarness::new();
    let task = Task::new("REINDEX", ProcessingMode::Background, json!({}), h.clock.now())
        .with_state(TaskState::ReadyForGpu);
    h.insert(&task).await.unwrap();

    let handles = h.engine.start().await.unwrap();

    // The execution loop's first tick fires immediately
    timeout(TEST_TIMEOUT, async {
        while h.task(task.id).await.unwrap().unwrap().state != TaskState::PythonOrchestrating {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("background task was never dispatched");

    h.engine.notify_interactive_start();

    timeout(TEST_TIMEOUT, async {
        loop {
            let state = h.task(task.id).await.unwrap().unwrap().state;
            if state == TaskState::ReadyForGpu {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("background task was not preempted");

    handles.abort();
    let stored = h.task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.dispatch_retry.retry_count, 0);
    assert_eq!(h.backend.cancelled(), vec![task.id]);
}

#[tokio::test]
async fn engine_runs_on_libsql_store() {
    let store = Arc::new(LibSqlTaskStore::new_memory().await.unwrap());
    let clock = Arc::new(ManualClock::new(start_time()));
    let backend = Arc::new(FakeExecutionBackend::new());
    let deps = EngineDeps::new(store.clone(), Arc::new(ScriptedQualifier::new()), backend.clone())
        .with_clock(clock.clone());
    let engine = TaskOrchestrationEngine::new(OrchestratorConfig::default(), deps);

    let task = Task::new("DOCUMENT", ProcessingMode::Foreground, json!({"n": 1}), clock.now())
        .with_state(TaskState::ReadyForQualification);
    assert!(store.insert_task(&task).await.unwrap());

    assert_eq!(engine.run_qualification_cycle().await.unwrap(), 1);
    assert_eq!(
        engine.run_execution_cycle().await.unwrap(),
        DispatchOutcome::Accepted(task.id)
    );
    assert_eq!(backend.accepted(), vec![task.id]);

    clock.advance(Duration::from_secs(30));
    assert!(engine.record_heartbeat(task.id, Some("step 2/3".into())).await.unwrap());
    assert_eq!(
        engine
            .handle_completion(CompletionReport::done(task.id))
            .await
            .unwrap(),
        CompletionEffect::Completed
    );

    let stored = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Completed);
    assert_eq!(stored.payload, json!({"n": 1}));
}
