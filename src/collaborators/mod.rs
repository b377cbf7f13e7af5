//! Ports to the systems the engine drives.
//!
//! - **Qualifier**: cheap classification of a task, many in parallel.
//! - **ExecutionBackend**: the expensive reasoning service, one at a time.
//! - **WorkspacePreparer**: per-task workspace setup before dispatch.
//!
//! `http` holds the reqwest adapters used by the service binary.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExecutionError, QualificationError, WorkspaceError};
use crate::task::{ProcessingMode, Task};

pub use http::{HttpExecutionBackend, HttpQualifier};

/// Where a qualified task goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualificationOutcome {
    /// Handled by qualification alone.
    Done,
    NeedsExpensiveExecution,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qualification {
    pub outcome: QualificationOutcome,
    #[serde(default)]
    pub summary: Option<String>,
}

impl Qualification {
    pub fn done(summary: impl Into<String>) -> Self {
        Self {
            outcome: QualificationOutcome::Done,
            summary: Some(summary.into()),
        }
    }

    pub fn needs_execution(summary: impl Into<String>) -> Self {
        Self {
            outcome: QualificationOutcome::NeedsExpensiveExecution,
            summary: Some(summary.into()),
        }
    }
}

/// Cheap classification step.
#[async_trait]
pub trait Qualifier: Send + Sync {
    async fn qualify(&self, task: &Task) -> Result<Qualification, QualificationError>;
}

/// Hint passed along with a dispatch so the backend can order its own work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityHint {
    Interactive,
    Background,
}

impl From<ProcessingMode> for PriorityHint {
    fn from(mode: ProcessingMode) -> Self {
        match mode {
            ProcessingMode::Foreground => Self::Interactive,
            ProcessingMode::Background => Self::Background,
        }
    }
}

/// Answer of the acceptance endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    /// Execution started; completion arrives later through the callback.
    Accepted,
    /// The single execution slot is taken. Not a failure.
    Busy,
    /// Backend is up but cannot take work right now.
    Unavailable(String),
}

/// The expensive execution service.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn accept(&self, task: &Task, priority: PriorityHint) -> Result<Acceptance, ExecutionError>;

    /// Ask the backend to stop a running execution. The interruption comes
    /// back through the completion callback.
    async fn cancel(&self, task_id: Uuid) -> Result<(), ExecutionError>;
}

/// Prepares whatever the task's execution needs locally (checkouts, scratch
/// directories) before the backend is called.
#[async_trait]
pub trait WorkspacePreparer: Send + Sync {
    async fn prepare(&self, task: &Task) -> Result<(), WorkspaceError>;
}

/// Preparer for deployments that need no workspace.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWorkspacePreparer;

#[async_trait]
impl WorkspacePreparer for NoopWorkspacePreparer {
    async fn prepare(&self, _task: &Task) -> Result<(), WorkspaceError> {
        Ok(())
    }
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    Done {
        #[serde(default)]
        details: Option<String>,
    },
    Error {
        message: String,
        #[serde(default)]
        retriable: bool,
    },
    /// Stopped before finishing. With a question the task waits for a
    /// human; without one it was preempted.
    Interrupted {
        #[serde(default)]
        question: Option<String>,
    },
}

/// Completion callback payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub task_id: Uuid,
    #[serde(flatten)]
    pub outcome: CompletionOutcome,
}

impl CompletionReport {
    pub fn done(task_id: Uuid) -> Self {
        Self {
            task_id,
            outcome: CompletionOutcome::Done { details: None },
        }
    }

    pub fn preempted(task_id: Uuid) -> Self {
        Self {
            task_id,
            outcome: CompletionOutcome::Interrupted { question: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completion_report_wire_format() {
        let id = Uuid::new_v4();
        let report: CompletionReport = serde_json::from_value(json!({
            "task_id": id,
            "outcome": "error",
            "message": "model crashed",
            "retriable": true
        }))
        .unwrap();
        assert_eq!(
            report.outcome,
            CompletionOutcome::Error {
                message: "model crashed".into(),
                retriable: true
            }
        );

        let interrupted: CompletionOutcome =
            serde_json::from_value(json!({"outcome": "interrupted"})).unwrap();
        assert_eq!(interrupted, CompletionOutcome::Interrupted { question: None });
    }

    #[test]
    fn qualification_outcome_is_screaming_case() {
        let q: Qualification =
            serde_json::from_value(json!({"outcome": "NEEDS_EXPENSIVE_EXECUTION"})).unwrap();
        assert_eq!(q.outcome, QualificationOutcome::NeedsExpensiveExecution);
        assert!(q.summary.is_none());
    }
}
