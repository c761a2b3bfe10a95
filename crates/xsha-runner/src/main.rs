//! Runner daemon: resolves configuration, opens the database, reaps
//! conversations orphaned by a previous crash, and drives the scheduler
//! until shutdown.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xsha_core::container::DockerRunner;
use xsha_core::credentials::CredentialMaterializer;
use xsha_core::executor::ConversationExecutor;
use xsha_core::logstream::LogBroadcaster;
use xsha_core::manager::ExecutionManager;
use xsha_core::scheduler::Scheduler;
use xsha_core::workspace::WorkspaceManager;
use xsha_db::pool;
use xsha_db::queries::conversations;
use xsha_db::queries::execution_logs::{self, LogMetadata};

use config::{CliOverrides, RunnerConfig};

#[derive(Parser)]
#[command(name = "xsha-runner", about = "AI task orchestrator execution engine")]
struct Cli {
    /// Path to the config file (defaults to ~/.config/xsha/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL (overrides XSHA_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file with a fresh encryption key (no database required)
    Init {
        /// SQLite database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the execution engine
    Serve {
        /// Root directory for per-task workspaces
        #[arg(long)]
        workspace_dir: Option<PathBuf>,
        /// Maximum number of concurrently running conversations
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => cmd_init(cli.config.as_deref(), db_url, force),
        Commands::Serve {
            workspace_dir,
            max_concurrent,
        } => {
            let overrides = CliOverrides {
                database_url: cli.database_url,
                workspace_dir,
                max_concurrent,
            };
            cmd_serve(cli.config.as_deref(), overrides).await
        }
    }
}

/// `xsha-runner init`: write a config file.
fn cmd_init(config_path: Option<&std::path::Path>, db_url: Option<String>, force: bool) -> Result<()> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(config::config_path);

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let aes_key = config::generate_aes_key();
    let db_url = db_url.unwrap_or_else(xsha_db::config::DbConfig::default_url);

    let file = config::ConfigFile {
        database: config::DatabaseSection {
            url: Some(db_url.clone()),
        },
        security: config::SecuritySection {
            aes_key: Some(aes_key.clone()),
        },
        ..Default::default()
    };
    config::save_config(&path, &file)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!(
        "  security.aes_key = {}...{}",
        &aes_key[..8],
        &aes_key[56..]
    );
    println!();
    println!("Next: run `xsha-runner serve` to start the engine.");

    Ok(())
}

/// `xsha-runner serve`: run the engine until shutdown.
async fn cmd_serve(config_path: Option<&std::path::Path>, overrides: CliOverrides) -> Result<()> {
    let resolved = RunnerConfig::resolve(config_path, &overrides)?;
    let engine = resolved.engine;

    let pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&pool).await?;

    reconcile_orphans(&pool).await?;

    let manager = Arc::new(ExecutionManager::new(engine.max_concurrent_tasks));
    let workspace = Arc::new(WorkspaceManager::from_config(&engine));
    let runner = Arc::new(DockerRunner::new(engine.docker_execution_timeout));
    let broadcaster = Arc::new(LogBroadcaster::default());
    let materializer = Arc::new(
        CredentialMaterializer::new(&engine.aes_key)
            .context("failed to initialize credential materializer")?,
    );

    let executor = Arc::new(ConversationExecutor::new(
        pool.clone(),
        Arc::clone(&manager),
        workspace,
        runner,
        broadcaster,
        materializer,
        engine.dev_environment_types.clone(),
    ));
    let scheduler = Scheduler::new(pool.clone(), executor, engine.scheduler_interval);

    info!(
        max_concurrent = engine.max_concurrent_tasks,
        workspace_root = %engine.workspace_base_dir.display(),
        "execution engine starting"
    );

    // Graceful shutdown: first signal stops the scheduler, second force-exits.
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down (Ctrl+C again to force)...");
            shutdown_trigger.cancel();
        }
    });

    scheduler.run(shutdown).await;

    info!("scheduler stopped; waiting is not required, running workers finish on their own");
    Ok(())
}

/// Restart recovery: rows still in `running` belong to a dead process. Move
/// them to `failed` and stamp their execution logs before the scheduler
/// starts handing out fresh work.
async fn reconcile_orphans(pool: &sqlx::SqlitePool) -> Result<()> {
    let orphans = conversations::fail_orphaned_running(pool).await?;
    for orphan in &orphans {
        warn!(conversation_id = orphan.id, "conversation orphaned by restart, marked failed");
        if let Ok(Some(log)) = execution_logs::get_by_conversation(pool, orphan.id).await {
            let _ = execution_logs::update_metadata(
                pool,
                log.id,
                &LogMetadata {
                    completed_at: Some(Utc::now()),
                    error_message: Some("orphaned by restart"),
                    ..Default::default()
                },
            )
            .await;
        }
    }
    if !orphans.is_empty() {
        info!(count = orphans.len(), "orphaned conversations reconciled");
    }
    Ok(())
}
