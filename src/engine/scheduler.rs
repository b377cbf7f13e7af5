//! Scheduler loop: promotes due one-shot and recurring tasks.
//!
//! A recurring task stays in `NEW` forever and only spawns execution copies.
//! Copies carry a correlation id derived from the occurrence, so replicas
//! racing on the same occurrence insert a single copy.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::TaskOrchestrationEngine;
use crate::clock::to_chrono;
use crate::error::DatabaseError;
use crate::schedule;
use crate::task::{ScheduleSpec, Task, TaskPatch, TaskState};

/// Maximum scheduled tasks handled per tick.
const SCHEDULER_BATCH: usize = 100;

impl TaskOrchestrationEngine {
    /// One tick. Returns how many tasks were promoted or spawned copies.
    pub async fn run_scheduler_cycle(&self) -> Result<usize, DatabaseError> {
        let now = self.clock.now();
        let horizon = now + to_chrono(self.config.scheduler.advance_window);
        let due = self.store.get_due_scheduled(horizon, SCHEDULER_BATCH).await?;

        let mut promoted = 0;
        for task in due {
            let result = if task.is_recurring() {
                self.fire_recurring(&task).await
            } else {
                self.promote_one_shot(&task).await
            };
            match result {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to promote scheduled task"),
            }
        }
        Ok(promoted)
    }

    async fn promote_one_shot(&self, task: &Task) -> Result<bool, DatabaseError> {
        let moved = self
            .store
            .conditional_update(
                task.id,
                TaskState::New,
                TaskState::ReadyForQualification,
                &TaskPatch::new().scheduled_at(None),
                self.clock.now(),
            )
            .await?;
        if moved {
            info!(task_id = %task.id, task_type = %task.task_type, "Scheduled task queued");
        }
        Ok(moved)
    }

    async fn fire_recurring(&self, task: &Task) -> Result<bool, DatabaseError> {
        let now = self.clock.now();
        let Some(ScheduleSpec {
            cron_expression: Some(expression),
            next_run_at: occurrence,
        }) = task.schedule()
        else {
            return self.promote_one_shot(task).await;
        };

        let copy = task.execution_copy(occurrence, now);
        let inserted = self.store.insert_task(&copy).await?;
        if !inserted {
            debug!(task_id = %task.id, occurrence = %occurrence, "Occurrence already spawned");
        }

        match schedule::next_occurrence(&expression, now.max(occurrence)) {
            Ok(next) => {
                let advanced = self
                    .store
                    .conditional_update(
                        task.id,
                        TaskState::New,
                        TaskState::New,
                        &TaskPatch::new().scheduled_at(Some(next)),
                        now,
                    )
                    .await?;
                if inserted {
                    info!(
                        task_id = %task.id,
                        copy_id = %copy.id,
                        next_run = %next,
                        "Recurring task fired"
                    );
                }
                Ok(inserted && advanced)
            }
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    error = %e,
                    "Recurring task has an unusable schedule, running it once"
                );
                self.store.delete_task(task.id).await?;
                Ok(inserted)
            }
        }
    }
}

/// Spawn the scheduler loop.
pub(crate) fn spawn_scheduler_loop(engine: Arc<TaskOrchestrationEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = engine.config.scheduler.interval;
        info!("Scheduler loop started (interval: {}s)", interval.as_secs());

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = engine.run_scheduler_cycle().await {
                warn!(error = %e, "Scheduler tick failed");
            }
        }
    })
}
