//! In-process liveness tracking for running executions.
//!
//! Heartbeats are best-effort: they live in memory only. After a restart
//! the store's `updated_at` is the fallback signal.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Latest heartbeat received for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub at: DateTime<Utc>,
    /// Free-form progress note from the executor.
    pub progress: Option<String>,
}

#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    beats: Mutex<HashMap<Uuid, Heartbeat>>,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, task_id: Uuid, at: DateTime<Utc>, progress: Option<String>) {
        let mut beats = self.beats.lock().unwrap_or_else(|e| e.into_inner());
        match beats.get_mut(&task_id) {
            Some(beat) if beat.at > at => {}
            _ => {
                beats.insert(task_id, Heartbeat { at, progress });
            }
        }
    }

    pub fn latest(&self, task_id: Uuid) -> Option<Heartbeat> {
        self.beats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .cloned()
    }

    pub fn last_seen(&self, task_id: Uuid) -> Option<DateTime<Utc>> {
        self.latest(task_id).map(|beat| beat.at)
    }

    /// Drop tracking for a task that left execution.
    pub fn forget(&self, task_id: Uuid) {
        self.beats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }

    /// Keep only the tasks for which `keep` returns true.
    pub fn retain(&self, mut keep: impl FnMut(Uuid) -> bool) {
        self.beats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|task_id, _| keep(*task_id));
    }

    pub fn tracked(&self) -> usize {
        self.beats.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
