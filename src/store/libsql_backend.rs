//! libSQL backend: async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. The compare-and-swap in
//! `conditional_update` is a single `UPDATE ... WHERE id = ? AND state = ?`,
//! so replicas sharing the same file coordinate through row counts.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{CandidateQuery, TaskQueue, TaskStore, check_transition};
use crate::task::{ProcessingMode, RetryState, Task, TaskPatch, TaskState};

/// libSQL task store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Run a `SELECT {TASK_COLUMNS} ...` and parse every row, skipping
    /// rows that fail to parse.
    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        values: Vec<Value>,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_task(&row) {
                    Ok(task) => tasks.push(task),
                    Err(e) => warn!("Skipping task row in {op}: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(tasks)
    }

    async fn query_count(&self, op: &str, sql: &str, values: Vec<Value>) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, processing_mode, task_type, state, payload, queue_position, \
     created_at, updated_at, scheduled_at, cron_expression, orchestration_started_at, \
     qualification_retry_count, qualification_next_retry_at, qualification_last_error, \
     dispatch_retry_count, dispatch_next_retry_at, dispatch_last_error, \
     workspace_retry_count, workspace_next_retry_at, workspace_last_error, \
     correlation_id, subject_id, summary, result";

const QUEUE_ORDER: &str = "ORDER BY queue_position IS NULL, queue_position ASC, created_at ASC";

/// Canonical write format: fixed width, so text order is time order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Value {
    match dt {
        Some(dt) => Value::Text(ts(dt)),
        None => Value::Null,
    }
}

fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp '{s}': {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn read_retry(row: &libsql::Row, start: i32) -> Result<RetryState, DatabaseError> {
    let count: i64 = row
        .get(start)
        .map_err(|e| DatabaseError::Serialization(format!("retry count: {e}")))?;
    Ok(RetryState {
        retry_count: u32::try_from(count.max(0)).unwrap_or(u32::MAX),
        next_retry_at: parse_optional_datetime(row.get::<String>(start + 1).ok())?,
        last_error: row.get::<String>(start + 2).ok(),
    })
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Serialization(e.to_string());

    let id_str: String = row.get(0).map_err(col)?;
    let mode_str: String = row.get(1).map_err(col)?;
    let task_type: String = row.get(2).map_err(col)?;
    let state_str: String = row.get(3).map_err(col)?;
    let payload_str: String = row.get(4).map_err(col)?;
    let created_str: String = row.get(6).map_err(col)?;
    let updated_str: String = row.get(7).map_err(col)?;
    let correlation_id: String = row.get(20).map_err(col)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("bad task id '{id_str}': {e}")))?;
    let processing_mode: ProcessingMode = mode_str.parse().map_err(DatabaseError::Serialization)?;
    let state: TaskState = state_str.parse().map_err(DatabaseError::Serialization)?;
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("payload of {id}: {e}")))?;

    Ok(Task {
        id,
        processing_mode,
        task_type,
        state,
        payload,
        queue_position: row.get::<i64>(5).ok(),
        created_at: parse_datetime(&created_str)?,
        updated_at: parse_datetime(&updated_str)?,
        scheduled_at: parse_optional_datetime(row.get::<String>(8).ok())?,
        cron_expression: row.get::<String>(9).ok(),
        orchestration_started_at: parse_optional_datetime(row.get::<String>(10).ok())?,
        qualification_retry: read_retry(row, 11)?,
        dispatch_retry: read_retry(row, 14)?,
        workspace_retry: read_retry(row, 17)?,
        correlation_id,
        subject_id: row.get::<String>(21).ok(),
        summary: row.get::<String>(22).ok(),
        result: row.get::<String>(23).ok(),
    })
}

/// Push `SET` assignments for one retry family.
fn push_retry(sets: &mut Vec<String>, values: &mut Vec<Value>, prefix: &str, retry: &RetryState) {
    sets.push(format!("{prefix}_retry_count = ?"));
    values.push(Value::Integer(i64::from(retry.retry_count)));
    sets.push(format!("{prefix}_next_retry_at = ?"));
    values.push(opt_ts(retry.next_retry_at));
    sets.push(format!("{prefix}_last_error = ?"));
    values.push(opt_text(retry.last_error.as_deref()));
}

/// Build the `SET` clause and its values for a patch.
fn patch_assignments(
    new: TaskState,
    patch: &TaskPatch,
    now: DateTime<Utc>,
) -> Result<(Vec<String>, Vec<Value>), DatabaseError> {
    let mut sets = vec!["state = ?".to_string(), "updated_at = ?".to_string()];
    let mut values = vec![Value::Text(new.as_str().to_string()), Value::Text(ts(now))];

    if let Some(payload) = &patch.payload {
        let json = serde_json::to_string(payload)
            .map_err(|e| DatabaseError::Serialization(format!("payload: {e}")))?;
        sets.push("payload = ?".into());
        values.push(Value::Text(json));
    }
    if let Some(at) = patch.scheduled_at {
        sets.push("scheduled_at = ?".into());
        values.push(opt_ts(at));
    }
    if let Some(at) = patch.orchestration_started_at {
        sets.push("orchestration_started_at = ?".into());
        values.push(opt_ts(at));
    }
    if let Some(retry) = &patch.qualification_retry {
        push_retry(&mut sets, &mut values, "qualification", retry);
    }
    if let Some(retry) = &patch.dispatch_retry {
        push_retry(&mut sets, &mut values, "dispatch", retry);
    }
    if let Some(retry) = &patch.workspace_retry {
        push_retry(&mut sets, &mut values, "workspace", retry);
    }
    if let Some(summary) = &patch.summary {
        sets.push("summary = ?".into());
        values.push(opt_text(summary.as_deref()));
    }
    if let Some(result) = &patch.result {
        sets.push("result = ?".into());
        values.push(opt_text(result.as_deref()));
    }
    Ok((sets, values))
}

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<bool, DatabaseError> {
        let payload = serde_json::to_string(&task.payload)
            .map_err(|e| DatabaseError::Serialization(format!("payload: {e}")))?;
        let queue_position = match task.queue_position {
            Some(p) => Value::Integer(p),
            None => Value::Null,
        };

        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO tasks ({TASK_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                      ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)"
                ),
                params![
                    task.id.to_string(),
                    task.processing_mode.as_str(),
                    task.task_type.clone(),
                    task.state.as_str(),
                    payload,
                    queue_position,
                    ts(task.created_at),
                    ts(task.updated_at),
                    opt_ts(task.scheduled_at),
                    opt_text(task.cron_expression.as_deref()),
                    opt_ts(task.orchestration_started_at),
                    i64::from(task.qualification_retry.retry_count),
                    opt_ts(task.qualification_retry.next_retry_at),
                    opt_text(task.qualification_retry.last_error.as_deref()),
                    i64::from(task.dispatch_retry.retry_count),
                    opt_ts(task.dispatch_retry.next_retry_at),
                    opt_text(task.dispatch_retry.last_error.as_deref()),
                    i64::from(task.workspace_retry.retry_count),
                    opt_ts(task.workspace_retry.next_retry_at),
                    opt_text(task.workspace_retry.last_error.as_deref()),
                    task.correlation_id.clone(),
                    opt_text(task.subject_id.as_deref()),
                    opt_text(task.summary.as_deref()),
                    opt_text(task.result.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        if inserted == 0 {
            debug!(correlation_id = %task.correlation_id, "Duplicate task insert ignored");
        }
        Ok(inserted > 0)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                "get_task",
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                vec![Value::Text(id.to_string())],
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
        Ok(deleted > 0)
    }

    async fn get_candidates(&self, query: &CandidateQuery) -> Result<Vec<Task>, DatabaseError> {
        let now = Value::Text(ts(query.now));
        let limit = Value::Integer(i64::try_from(query.limit).unwrap_or(i64::MAX));

        let (filter, values) = match query.queue {
            TaskQueue::Qualification => (
                "state = ?1 \
                 AND (qualification_next_retry_at IS NULL OR qualification_next_retry_at <= ?2)",
                vec![
                    Value::Text(TaskState::ReadyForQualification.as_str().to_string()),
                    now,
                    limit,
                ],
            ),
            TaskQueue::Execution(mode) => (
                "state = ?1 \
                 AND (dispatch_next_retry_at IS NULL OR dispatch_next_retry_at <= ?2) \
                 AND (workspace_next_retry_at IS NULL OR workspace_next_retry_at <= ?2) \
                 AND processing_mode = ?4",
                vec![
                    Value::Text(TaskState::ReadyForGpu.as_str().to_string()),
                    now,
                    limit,
                    Value::Text(mode.as_str().to_string()),
                ],
            ),
        };

        self.query_tasks(
            "get_candidates",
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE {filter} {QUEUE_ORDER} LIMIT ?3"),
            values,
        )
        .await
    }

    async fn get_due_scheduled(
        &self,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "get_due_scheduled",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE state = ?1 AND scheduled_at IS NOT NULL AND scheduled_at <= ?2 \
                 ORDER BY scheduled_at ASC, created_at ASC LIMIT ?3"
            ),
            vec![
                Value::Text(TaskState::New.as_str().to_string()),
                Value::Text(ts(horizon)),
                Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)),
            ],
        )
        .await
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected: TaskState,
        new: TaskState,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        check_transition(id, expected, new)?;

        let (sets, mut values) = patch_assignments(new, patch, now)?;
        values.push(Value::Text(id.to_string()));
        values.push(Value::Text(expected.as_str().to_string()));

        let sql = format!(
            "UPDATE tasks SET {} WHERE id = ? AND state = ?",
            sets.join(", ")
        );
        let updated = self
            .conn()
            .execute(&sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("conditional_update: {e}")))?;
        Ok(updated > 0)
    }

    async fn count_by_state(&self, state: TaskState) -> Result<u64, DatabaseError> {
        self.query_count(
            "count_by_state",
            "SELECT COUNT(*) FROM tasks WHERE state = ?1",
            vec![Value::Text(state.as_str().to_string())],
        )
        .await
    }

    async fn list_by_state(&self, state: TaskState) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "list_by_state",
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE state = ?1 {QUEUE_ORDER}"),
            vec![Value::Text(state.as_str().to_string())],
        )
        .await
    }

    async fn find_stale(
        &self,
        state: TaskState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "find_stale",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE state = ?1 AND updated_at < ?2 {QUEUE_ORDER}"
            ),
            vec![
                Value::Text(state.as_str().to_string()),
                Value::Text(ts(updated_before)),
            ],
        )
        .await
    }

    async fn count_pending_of_type(&self, task_type: &str) -> Result<u64, DatabaseError> {
        self.query_count(
            "count_pending_of_type",
            "SELECT COUNT(*) FROM tasks WHERE task_type = ?1 AND state NOT IN (?2, ?3, ?4)",
            vec![
                Value::Text(task_type.to_string()),
                Value::Text(TaskState::Done.as_str().to_string()),
                Value::Text(TaskState::Completed.as_str().to_string()),
                Value::Text(TaskState::Error.as_str().to_string()),
            ],
        )
        .await
    }

    // ── Subject messages ────────────────────────────────────────────

    async fn record_message(
        &self,
        subject_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO subject_messages (subject_id, received_at) VALUES (?1, ?2)",
                params![subject_id, ts(received_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_message: {e}")))?;
        Ok(())
    }

    async fn message_count_since(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.query_count(
            "message_count_since",
            "SELECT COUNT(*) FROM subject_messages WHERE subject_id = ?1 AND received_at > ?2",
            vec![Value::Text(subject_id.to_string()), Value::Text(ts(since))],
        )
        .await
    }
}
