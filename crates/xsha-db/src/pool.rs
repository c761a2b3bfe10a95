use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

use crate::config::DbConfig;

/// Migrations embedded at compile time from `crates/xsha-db/migrations/`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Create a connection pool with sensible defaults.
///
/// On-disk databases get WAL journaling and a busy timeout so concurrent
/// workers appending log lines do not trip over the writer lock. In-memory
/// databases are pinned to a single connection: every SQLite `:memory:`
/// connection is its own database.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    let mut options = SqliteConnectOptions::from_str(&config.database_url)
        .with_context(|| format!("invalid database url {}", config.database_url))?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);
    if !config.is_in_memory() {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let mut pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(10));
    if config.is_in_memory() {
        // The single connection IS the database; it must never be retired.
        pool_options = pool_options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        pool_options = pool_options.max_connections(5);
    }

    let pool = pool_options
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", config.database_url))?;

    Ok(pool)
}

/// Run all pending embedded migrations against the pool.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied successfully");
    Ok(())
}
