//! Query functions for the `git_credentials` table.
//!
//! Secrets are stored encrypted; nothing in this module decrypts them.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{CredentialKind, GitCredential};

/// Insert a new credential row. `secret_enc` and `private_key_enc` must
/// already be encrypted by the caller.
pub async fn insert_credential(
    pool: &SqlitePool,
    name: &str,
    cred_type: CredentialKind,
    username: &str,
    secret_enc: &str,
    private_key_enc: Option<&str>,
    public_key: Option<&str>,
) -> Result<GitCredential> {
    let credential = sqlx::query_as::<_, GitCredential>(
        "INSERT INTO git_credentials \
         (name, cred_type, username, secret_enc, private_key_enc, public_key, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         RETURNING *",
    )
    .bind(name)
    .bind(cred_type)
    .bind(username)
    .bind(secret_enc)
    .bind(private_key_enc)
    .bind(public_key)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert git credential")?;

    Ok(credential)
}

/// Fetch a single credential by ID.
pub async fn get_credential(pool: &SqlitePool, id: i64) -> Result<Option<GitCredential>> {
    let credential =
        sqlx::query_as::<_, GitCredential>("SELECT * FROM git_credentials WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch git credential")?;

    Ok(credential)
}
