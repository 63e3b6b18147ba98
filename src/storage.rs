//! Metadata store adapter.
//!
//! One SQL statement per function. State transitions are guarded in SQL
//! (`WHERE status = ...`) so concurrent callers cannot clobber each
//! other; the guard outcome is reported through `RETURNING` or the
//! affected-row count. Timestamps are always bound from the caller's
//! clock rather than taken from `NOW()`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::schema::{TaskPriority, TaskRecord, TaskStatus};

const TASK_COLUMNS: &str = "id, task_name, args, kwargs, priority, status, result, \
     error_message, retry_count, max_retries, retry_delay, timeout, queue_name, worker_id, \
     created_at, updated_at, started_at, completed_at, next_retry_at";

/// Create the `tasks` table and its indexes if they do not exist yet.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub(crate) async fn insert_task(pool: &PgPool, task: &TaskRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO tasks (id, task_name, args, kwargs, priority, status, retry_count,
                           max_retries, retry_delay, timeout, queue_name, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ",
    )
    .bind(task.id)
    .bind(&task.task_name)
    .bind(&task.args)
    .bind(&task.kwargs)
    .bind(task.priority)
    .bind(task.status)
    .bind(task.retry_count)
    .bind(task.max_retries)
    .bind(task.retry_delay)
    .bind(task.timeout)
    .bind(&task.queue_name)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load one task record by id.
pub async fn find_task(pool: &PgPool, task_id: Uuid) -> Result<Option<TaskRecord>, sqlx::Error> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
    sqlx::query_as::<_, TaskRecord>(&sql)
        .bind(task_id)
        .fetch_optional(pool)
        .await
}

/// Move a claimed task to `processing`, stamping the worker and the
/// first-start time. Returns the updated record, or `None` when the row
/// was not in a claimable state.
pub(crate) async fn mark_processing(
    pool: &PgPool,
    task_id: Uuid,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<TaskRecord>, sqlx::Error> {
    let sql = format!(
        r"
        UPDATE tasks
        SET status = 'processing', worker_id = $2,
            started_at = COALESCE(started_at, $3), updated_at = $3
        WHERE id = $1 AND status IN ('pending', 'retry')
        RETURNING {TASK_COLUMNS}
        "
    );
    sqlx::query_as::<_, TaskRecord>(&sql)
        .bind(task_id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(pool)
        .await
}

/// Record a successful attempt. Guarded so a reclaimed-and-requeued task
/// cannot be clobbered by a worker that lost its claim.
pub(crate) async fn mark_success(
    pool: &PgPool,
    task_id: Uuid,
    result: Json<Value>,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r"
        UPDATE tasks
        SET status = 'success', result = $2, completed_at = $3, updated_at = $3
        WHERE id = $1 AND status = 'processing'
        ",
    )
    .bind(task_id)
    .bind(result)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() > 0)
}

/// Move a task to `retry`. `error_message` is preserved when `None`
/// (used by [`reschedule`](crate::QueueManager::reschedule), which does
/// not consume an attempt).
pub(crate) async fn mark_retry(
    pool: &PgPool,
    task_id: Uuid,
    retry_count: i32,
    next_retry_at: DateTime<Utc>,
    error_message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r"
        UPDATE tasks
        SET status = 'retry', retry_count = $2, next_retry_at = $3,
            error_message = COALESCE($4, error_message), updated_at = $5
        WHERE id = $1 AND status = 'processing'
        ",
    )
    .bind(task_id)
    .bind(retry_count)
    .bind(next_retry_at)
    .bind(error_message)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() > 0)
}

/// Terminal failure. `retry_count_override` is used for non-retryable
/// failures, which consume the whole budget at once.
pub(crate) async fn mark_failed(
    pool: &PgPool,
    task_id: Uuid,
    error_message: &str,
    retry_count_override: Option<i32>,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r"
        UPDATE tasks
        SET status = 'failed', error_message = $2, completed_at = $3, updated_at = $3,
            retry_count = COALESCE($4, retry_count), next_retry_at = NULL
        WHERE id = $1 AND status = 'processing'
        ",
    )
    .bind(task_id)
    .bind(error_message)
    .bind(now)
    .bind(retry_count_override)
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() > 0)
}

/// Flip a `retry` row back to `pending`. The status guard makes
/// concurrent promotion idempotent: exactly one caller observes `true`.
pub(crate) async fn promote_to_pending(
    pool: &PgPool,
    task_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        r"
        UPDATE tasks
        SET status = 'pending', next_retry_at = NULL, updated_at = $2
        WHERE id = $1 AND status = 'retry'
        ",
    )
    .bind(task_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(updated.rows_affected() > 0)
}

/// List task records, newest first, optionally filtered by status and
/// queue.
pub async fn list_tasks(
    pool: &PgPool,
    status: Option<TaskStatus>,
    queue_name: Option<&str>,
) -> Result<Vec<TaskRecord>, sqlx::Error> {
    let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
    let mut clauses = Vec::new();
    if status.is_some() {
        clauses.push("status = $1");
    }
    if queue_name.is_some() {
        clauses.push(if status.is_some() {
            "queue_name = $2"
        } else {
            "queue_name = $1"
        });
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC");

    let mut query = sqlx::query_as::<_, TaskRecord>(&sql);
    if let Some(status) = status {
        query = query.bind(status);
    }
    if let Some(queue_name) = queue_name {
        query = query.bind(queue_name);
    }
    query.fetch_all(pool).await
}

/// Largest per-attempt timeout among currently claimed tasks, if any.
pub(crate) async fn max_processing_timeout(
    pool: &PgPool,
    queue_name: &str,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, Option<i64>>(
        "SELECT MAX(timeout) FROM tasks WHERE queue_name = $1 AND status = 'processing'",
    )
    .bind(queue_name)
    .fetch_one(pool)
    .await
}

/// Number of tasks per status for one queue.
pub async fn status_counts(
    pool: &PgPool,
    queue_name: &str,
) -> Result<Vec<(TaskStatus, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (TaskStatus, i64)>(
        "SELECT status, COUNT(*) FROM tasks WHERE queue_name = $1 GROUP BY status",
    )
    .bind(queue_name)
    .fetch_all(pool)
    .await
}

/// A non-terminal row the recovery sweep may need to re-push.
#[derive(Debug, FromRow)]
pub(crate) struct RecoverableTask {
    pub(crate) id: Uuid,
    pub(crate) priority: TaskPriority,
    pub(crate) status: TaskStatus,
    pub(crate) timeout: i64,
    pub(crate) next_retry_at: Option<DateTime<Utc>>,
}

/// Pending/retry rows for `queue_name` that were last touched before
/// `cutoff`. Fresh rows are excluded so the sweep does not race an
/// enqueue that has not pushed to the broker yet.
pub(crate) async fn recoverable_tasks(
    pool: &PgPool,
    queue_name: &str,
    cutoff: DateTime<Utc>,
) -> Result<Vec<RecoverableTask>, sqlx::Error> {
    sqlx::query_as::<_, RecoverableTask>(
        r"
        SELECT id, priority, status, timeout, next_retry_at
        FROM tasks
        WHERE queue_name = $1 AND status IN ('pending', 'retry') AND updated_at < $2
        ",
    )
    .bind(queue_name)
    .bind(cutoff)
    .fetch_all(pool)
    .await
}
