//! Query functions for the `dev_environments` table. Read-only to the
//! execution engine.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::models::DevEnvironment;

/// Insert a new dev environment row.
pub async fn insert_environment(
    pool: &SqlitePool,
    name: &str,
    env_type: &str,
    cpu_limit: Option<f64>,
    memory_limit: Option<i64>,
    env_vars: HashMap<String, String>,
) -> Result<DevEnvironment> {
    let environment = sqlx::query_as::<_, DevEnvironment>(
        "INSERT INTO dev_environments \
         (name, env_type, cpu_limit, memory_limit, env_vars, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         RETURNING *",
    )
    .bind(name)
    .bind(env_type)
    .bind(cpu_limit)
    .bind(memory_limit)
    .bind(Json(env_vars))
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert dev environment")?;

    Ok(environment)
}

/// Fetch a single dev environment by ID.
pub async fn get_environment(pool: &SqlitePool, id: i64) -> Result<Option<DevEnvironment>> {
    let environment =
        sqlx::query_as::<_, DevEnvironment>("SELECT * FROM dev_environments WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch dev environment")?;

    Ok(environment)
}
