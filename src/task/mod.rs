//! Task model: record, state machine and retry bookkeeping.

pub mod model;
pub mod state;

pub use model::{
    IDLE_REVIEW_TASK_TYPE, RetryState, ScheduleSpec, Task, TaskPatch, queue_order,
};
pub use state::{ProcessingMode, TaskState};
