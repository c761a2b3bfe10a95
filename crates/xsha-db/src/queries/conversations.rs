//! Query functions for the `conversations` table, including the pending
//! queue drain used by the scheduler.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{Conversation, ConversationStatus, PendingConversation};
use crate::queries::{credentials, environments, projects, tasks};

/// Insert a new conversation in `pending`.
pub async fn insert_conversation(
    pool: &SqlitePool,
    task_id: Option<i64>,
    content: &str,
) -> Result<Conversation> {
    let now = Utc::now();
    let conversation = sqlx::query_as::<_, Conversation>(
        "INSERT INTO conversations (task_id, content, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(content)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert conversation")?;

    Ok(conversation)
}

/// Fetch a single conversation by ID.
pub async fn get_conversation(pool: &SqlitePool, id: i64) -> Result<Option<Conversation>> {
    let conversation = sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch conversation")?;

    Ok(conversation)
}

/// Unconditionally set a conversation's status.
pub async fn update_status(
    pool: &SqlitePool,
    id: i64,
    status: ConversationStatus,
) -> Result<()> {
    let result = sqlx::query("UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(status)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update conversation status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("conversation {id} not found");
    }

    Ok(())
}

/// Guarded status transition: only applies when the stored status still
/// equals `from`. Returns the number of affected rows (0 on a lost race).
pub async fn transition_status(
    pool: &SqlitePool,
    id: i64,
    from: ConversationStatus,
    to: ConversationStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(to)
    .bind(Utc::now())
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .with_context(|| format!("failed to transition conversation {id} from {from} to {to}"))?;

    Ok(result.rows_affected())
}

/// Record the commit hash produced by a successful run.
pub async fn set_commit_hash(pool: &SqlitePool, id: i64, commit_hash: &str) -> Result<()> {
    sqlx::query("UPDATE conversations SET commit_hash = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(commit_hash)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set conversation commit hash")?;

    Ok(())
}

/// Fetch every `pending` conversation with its task, project, environment
/// and credential eagerly loaded, oldest first.
pub async fn get_pending_with_details(pool: &SqlitePool) -> Result<Vec<PendingConversation>> {
    let rows = sqlx::query_as::<_, Conversation>(
        "SELECT * FROM conversations WHERE status = 'pending' ORDER BY created_at ASC, id ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list pending conversations")?;

    let mut out = Vec::with_capacity(rows.len());
    for conversation in rows {
        out.push(load_details(pool, conversation).await?);
    }
    Ok(out)
}

/// Fetch one conversation with details, regardless of status. Used by the
/// retry path after resetting a conversation to `pending`.
pub async fn get_with_details(pool: &SqlitePool, id: i64) -> Result<Option<PendingConversation>> {
    let Some(conversation) = get_conversation(pool, id).await? else {
        return Ok(None);
    };
    Ok(Some(load_details(pool, conversation).await?))
}

async fn load_details(
    pool: &SqlitePool,
    conversation: Conversation,
) -> Result<PendingConversation> {
    let task = match conversation.task_id {
        Some(task_id) => tasks::get_task(pool, task_id).await?,
        None => None,
    };
    let project = match task.as_ref().and_then(|t| t.project_id) {
        Some(project_id) => projects::get_project(pool, project_id).await?,
        None => None,
    };
    let environment = match task.as_ref().and_then(|t| t.dev_environment_id) {
        Some(env_id) => environments::get_environment(pool, env_id).await?,
        None => None,
    };
    let credential = match project.as_ref().and_then(|p| p.credential_id) {
        Some(cred_id) => credentials::get_credential(pool, cred_id).await?,
        None => None,
    };

    Ok(PendingConversation {
        conversation,
        task,
        project,
        environment,
        credential,
    })
}

/// True when the task has any conversation in `pending` or `running`.
/// The conversation-create path uses this to keep the per-task workspace
/// single-writer.
pub async fn has_pending_or_running_for_task(pool: &SqlitePool, task_id: i64) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM conversations \
         WHERE task_id = ?1 AND status IN ('pending', 'running')",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to count pending/running conversations for task")?;

    Ok(row.0 > 0)
}

/// Restart recovery: mark every `running` conversation `failed` and return
/// the affected rows. A fresh process has no registry entries, so any row
/// still in `running` was orphaned by a crash.
pub async fn fail_orphaned_running(pool: &SqlitePool) -> Result<Vec<Conversation>> {
    let orphans = sqlx::query_as::<_, Conversation>(
        "SELECT * FROM conversations WHERE status = 'running'",
    )
    .fetch_all(pool)
    .await
    .context("failed to list running conversations")?;

    for orphan in &orphans {
        update_status(pool, orphan.id, ConversationStatus::Failed).await?;
    }

    Ok(orphans)
}
