//! Task state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Created by a producer, not yet queued (also: recurring schedules).
    New,
    /// Ingestion is extracting content.
    Indexing,
    /// Ingestion finished; waiting to be queued for qualification.
    Indexed,
    /// Waiting for the cheap classification step.
    ReadyForQualification,
    /// Claimed by a qualification worker.
    Qualifying,
    /// Qualification decided no expensive work is needed.
    Done,
    /// Waiting for expensive execution.
    ReadyForGpu,
    /// Claimed for dispatch, acceptance pending.
    DispatchedGpu,
    /// Expensive execution in progress on the backend.
    PythonOrchestrating,
    /// Expensive execution finished.
    Completed,
    /// Parked until a human responds.
    UserTask,
    /// Permanent failure; needs intervention.
    Error,
}

impl TaskState {
    pub const ALL: [TaskState; 12] = [
        TaskState::New,
        TaskState::Indexing,
        TaskState::Indexed,
        TaskState::ReadyForQualification,
        TaskState::Qualifying,
        TaskState::Done,
        TaskState::ReadyForGpu,
        TaskState::DispatchedGpu,
        TaskState::PythonOrchestrating,
        TaskState::Completed,
        TaskState::UserTask,
        TaskState::Error,
    ];

    /// States a crash can leave a task stuck in.
    pub const TRANSIENT: [TaskState; 3] = [
        TaskState::Qualifying,
        TaskState::DispatchedGpu,
        TaskState::PythonOrchestrating,
    ];

    /// Check if this state allows transitioning to another state.
    ///
    /// Same-state updates are field updates and are always allowed.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        if *self == target {
            return true;
        }

        matches!(
            (self, target),
            // Ingestion
            (New, Indexing) | (Indexing, Indexed) | (Indexing, Error) |
            (New, ReadyForQualification) | (Indexed, ReadyForQualification) |
            // Qualification
            (ReadyForQualification, Qualifying) |
            (Qualifying, Done) | (Qualifying, ReadyForGpu) |
            (Qualifying, ReadyForQualification) | (Qualifying, Error) |
            // Dispatch
            (ReadyForGpu, DispatchedGpu) |
            (DispatchedGpu, PythonOrchestrating) | (DispatchedGpu, ReadyForGpu) |
            (DispatchedGpu, Error) |
            // Execution exits
            (PythonOrchestrating, Completed) | (PythonOrchestrating, ReadyForGpu) |
            (PythonOrchestrating, UserTask) | (PythonOrchestrating, Error) |
            // Human response
            (UserTask, ReadyForGpu)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Completed | Self::Error)
    }

    /// Queued or running work, i.e. the system is not idle while any task is here.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            Self::ReadyForQualification
                | Self::Qualifying
                | Self::ReadyForGpu
                | Self::DispatchedGpu
                | Self::PythonOrchestrating
        )
    }

    pub fn is_transient(&self) -> bool {
        Self::TRANSIENT.contains(self)
    }

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Indexing => "INDEXING",
            Self::Indexed => "INDEXED",
            Self::ReadyForQualification => "READY_FOR_QUALIFICATION",
            Self::Qualifying => "QUALIFYING",
            Self::Done => "DONE",
            Self::ReadyForGpu => "READY_FOR_GPU",
            Self::DispatchedGpu => "DISPATCHED_GPU",
            Self::PythonOrchestrating => "PYTHON_ORCHESTRATING",
            Self::Completed => "COMPLETED",
            Self::UserTask => "USER_TASK",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown task state: {s}"))
    }
}

/// Which queue a task is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingMode {
    /// Interactive work; never gated by user activity.
    Foreground,
    /// Background work; preempted by interactive requests.
    Background,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foreground => "FOREGROUND",
            Self::Background => "BACKGROUND",
        }
    }
}

impl std::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FOREGROUND" => Ok(Self::Foreground),
            "BACKGROUND" => Ok(Self::Background),
            other => Err(format!("unknown processing mode: {other}")),
        }
    }
}
