//! Query functions for the `conversation_results` table.
//!
//! At most one result per conversation, enforced by a UNIQUE constraint.
//! Rows are never updated once created.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::models::ConversationResult;

/// Fields of a parsed agent result, ready for insertion.
#[derive(Debug, Clone)]
pub struct NewConversationResult {
    pub conversation_id: i64,
    pub result_type: String,
    pub subtype: String,
    pub is_error: bool,
    pub session_id: String,
    /// The full parsed object, including free-form additional fields.
    pub payload: serde_json::Value,
}

/// Insert a result row. Fails on a second insert for the same conversation.
pub async fn insert_result(
    pool: &SqlitePool,
    new: &NewConversationResult,
) -> Result<ConversationResult> {
    let result = sqlx::query_as::<_, ConversationResult>(
        "INSERT INTO conversation_results \
         (conversation_id, result_type, subtype, is_error, session_id, payload, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         RETURNING *",
    )
    .bind(new.conversation_id)
    .bind(&new.result_type)
    .bind(&new.subtype)
    .bind(new.is_error)
    .bind(&new.session_id)
    .bind(Json(new.payload.clone()))
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert conversation result")?;

    Ok(result)
}

/// True when a result row already exists for the conversation.
pub async fn exists_by_conversation(pool: &SqlitePool, conversation_id: i64) -> Result<bool> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM conversation_results WHERE conversation_id = ?1")
            .bind(conversation_id)
            .fetch_one(pool)
            .await
            .context("failed to check for existing conversation result")?;

    Ok(row.0 > 0)
}

/// Fetch the result for a conversation, if any.
pub async fn get_by_conversation(
    pool: &SqlitePool,
    conversation_id: i64,
) -> Result<Option<ConversationResult>> {
    let result = sqlx::query_as::<_, ConversationResult>(
        "SELECT * FROM conversation_results WHERE conversation_id = ?1",
    )
    .bind(conversation_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch conversation result")?;

    Ok(result)
}

/// Delete the result for a conversation, if any. Used by retry so a rerun
/// cannot surface stale data. Returns the number of deleted rows.
pub async fn delete_by_conversation(pool: &SqlitePool, conversation_id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM conversation_results WHERE conversation_id = ?1")
        .bind(conversation_id)
        .execute(pool)
        .await
        .context("failed to delete conversation result")?;

    Ok(result.rows_affected())
}
