//! Error types for the orchestrator.

use uuid::Uuid;

use crate::task::TaskState;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transition {from} -> {to} is not allowed for task {id}")]
    InvalidTransition {
        id: Uuid,
        from: TaskState,
        to: TaskState,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Cron parsing errors. Callers degrade the task to a one-shot.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Schedule '{0}' has no upcoming occurrence")]
    Exhausted(String),
}

/// Failure reported by the qualification collaborator.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct QualificationError {
    pub message: String,
    pub retriable: bool,
}

impl QualificationError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

/// Failure talking to the execution backend.
///
/// "Busy" is not an error; it comes back as `Acceptance::Busy`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Execution backend transport failure: {0}")]
    Transport(String),

    #[error("Execution backend rejected task: {0}")]
    Rejected(String),
}

impl ExecutionError {
    /// Transport failures are retried forever; rejections park the task in ERROR.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Workspace preparation failures.
#[derive(Debug, thiserror::Error)]
#[error("Workspace preparation failed: {message}")]
pub struct WorkspaceError {
    pub message: String,
    pub retriable: bool,
}

impl WorkspaceError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

/// Errors raised by engine operations on a single task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is in state {state}, expected {expected}")]
    UnexpectedState {
        id: Uuid,
        state: TaskState,
        expected: TaskState,
    },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
