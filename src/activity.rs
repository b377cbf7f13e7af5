//! Interactive activity signal.
//!
//! Written by the request-intake path whenever an interactive request
//! starts. Read by the execution loop to gate background dispatch, and
//! broadcast to the preemption watcher so running background work can be
//! cancelled immediately.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::to_chrono;

const NEVER: i64 = i64::MIN;

/// Shared "last interactive activity" timestamp with change notification.
#[derive(Debug)]
pub struct ActivitySignal {
    last_activity_ms: AtomicI64,
    tx: broadcast::Sender<DateTime<Utc>>,
}

impl ActivitySignal {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            last_activity_ms: AtomicI64::new(NEVER),
            tx,
        }
    }

    /// Mark an interactive request as started at `at`.
    ///
    /// The stored timestamp never moves backwards.
    pub fn record_activity(&self, at: DateTime<Utc>) {
        self.last_activity_ms
            .fetch_max(at.timestamp_millis(), Ordering::SeqCst);
        // No subscribers is fine
        let receivers = self.tx.send(at).unwrap_or(0);
        debug!(at = %at, receivers, "Interactive activity recorded");
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        match self.last_activity_ms.load(Ordering::SeqCst) {
            NEVER => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    /// Whether no interactive activity happened within `period` before `now`.
    pub fn is_quiet(&self, now: DateTime<Utc>, period: Duration) -> bool {
        self.last_activity()
            .is_none_or(|last| now - last >= to_chrono(period))
    }

    /// Receive a timestamp each time activity is recorded.
    pub fn subscribe(&self) -> broadcast::Receiver<DateTime<Utc>> {
        self.tx.subscribe()
    }
}

impl Default for ActivitySignal {
    fn default() -> Self {
        Self::new()
    }
}
