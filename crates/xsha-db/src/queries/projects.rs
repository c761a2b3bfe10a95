//! Query functions for the `projects` table. Read-only to the execution
//! engine; inserts exist for the API layer and test fixtures.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{GitProtocol, Project};

/// Insert a new project row.
pub async fn insert_project(
    pool: &SqlitePool,
    name: &str,
    repo_url: &str,
    protocol: GitProtocol,
    credential_id: Option<i64>,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (name, repo_url, protocol, credential_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         RETURNING *",
    )
    .bind(name)
    .bind(repo_url)
    .bind(protocol)
    .bind(credential_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert project")?;

    Ok(project)
}

/// Fetch a single project by ID.
pub async fn get_project(pool: &SqlitePool, id: i64) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}
