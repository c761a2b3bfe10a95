//! Query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::Task;

/// Insert a new task row.
pub async fn insert_task(
    pool: &SqlitePool,
    title: &str,
    project_id: Option<i64>,
    dev_environment_id: Option<i64>,
    start_branch: &str,
    work_branch: Option<&str>,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
         (title, project_id, dev_environment_id, start_branch, work_branch, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         RETURNING *",
    )
    .bind(title)
    .bind(project_id)
    .bind(dev_environment_id)
    .bind(start_branch)
    .bind(work_branch)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &SqlitePool, id: i64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Record the workspace path assigned to a task on first execution.
/// The path is stable once set.
pub async fn set_workspace_path(pool: &SqlitePool, id: i64, path: &str) -> Result<()> {
    let result = sqlx::query("UPDATE tasks SET workspace_path = ?1 WHERE id = ?2")
        .bind(path)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set task workspace path")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}
