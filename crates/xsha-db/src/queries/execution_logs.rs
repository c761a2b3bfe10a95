//! Query functions for the `execution_logs` table.
//!
//! The `logs` blob is append-only: the only writers are [`append_logs`]
//! (atomic SQL concatenation) and [`delete_by_conversation`] on retry.
//! Metadata updates go through a field-scoped UPDATE that never touches
//! `logs`, so they cannot clobber lines appended concurrently by the
//! container pipe readers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::ExecutionLog;

/// Metadata fields settable without touching the `logs` blob. `None` leaves
/// the stored value unchanged.
#[derive(Debug, Clone, Default)]
pub struct LogMetadata<'a> {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<&'a str>,
    pub docker_command: Option<&'a str>,
}

/// Create the execution-log row for a conversation with an empty blob.
pub async fn create_for_conversation(
    pool: &SqlitePool,
    conversation_id: i64,
) -> Result<ExecutionLog> {
    let log = sqlx::query_as::<_, ExecutionLog>(
        "INSERT INTO execution_logs (conversation_id, logs, created_at) \
         VALUES (?1, '', ?2) \
         RETURNING *",
    )
    .bind(conversation_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to create execution log")?;

    Ok(log)
}

/// Fetch the execution log for a conversation, if any.
pub async fn get_by_conversation(
    pool: &SqlitePool,
    conversation_id: i64,
) -> Result<Option<ExecutionLog>> {
    let log = sqlx::query_as::<_, ExecutionLog>(
        "SELECT * FROM execution_logs WHERE conversation_id = ?1 ORDER BY id DESC LIMIT 1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch execution log")?;

    Ok(log)
}

/// Atomically append text to the log blob.
pub async fn append_logs(pool: &SqlitePool, id: i64, text: &str) -> Result<()> {
    let result = sqlx::query("UPDATE execution_logs SET logs = logs || ?1 WHERE id = ?2")
        .bind(text)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to append to execution log")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("execution log {id} not found");
    }

    Ok(())
}

/// Field-scoped metadata update. Only the fields present in `meta` change;
/// the `logs` blob is never part of the statement.
pub async fn update_metadata(
    pool: &SqlitePool,
    id: i64,
    meta: &LogMetadata<'_>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE execution_logs SET \
         started_at = COALESCE(?1, started_at), \
         completed_at = COALESCE(?2, completed_at), \
         error_message = COALESCE(?3, error_message), \
         docker_command = COALESCE(?4, docker_command) \
         WHERE id = ?5",
    )
    .bind(meta.started_at)
    .bind(meta.completed_at)
    .bind(meta.error_message)
    .bind(meta.docker_command)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update execution log metadata")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("execution log {id} not found");
    }

    Ok(())
}

/// Number of log rows for a conversation. The invariant is 0 or 1.
pub async fn count_by_conversation(pool: &SqlitePool, conversation_id: i64) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM execution_logs WHERE conversation_id = ?1")
            .bind(conversation_id)
            .fetch_one(pool)
            .await
            .context("failed to count execution logs")?;

    Ok(row.0)
}

/// Delete every execution-log row for a conversation. Used by retry before
/// a fresh row is created. Returns the number of deleted rows.
pub async fn delete_by_conversation(pool: &SqlitePool, conversation_id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM execution_logs WHERE conversation_id = ?1")
        .bind(conversation_id)
        .execute(pool)
        .await
        .context("failed to delete execution logs")?;

    Ok(result.rows_affected())
}
