//! Per-conversation orchestration: state transitions, workspace
//! preparation, container invocation, commit, and cleanup.
//!
//! `process` validates the conversation, flips it `pending → running`,
//! takes a slot in the execution manager, and launches a worker task. The
//! worker walks the stages with a cancellation check before each one and
//! always falls through to a cleanup path that releases the slot, persists
//! the terminal status, resets a dirty workspace on failure/cancel, stamps
//! the execution-log metadata, broadcasts the outcome, and invokes the
//! result parser. Errors never escape the worker.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use xsha_db::models::{
    Conversation, ConversationStatus, DevEnvironment, GitCredential, PendingConversation,
    Project, Task,
};
use xsha_db::queries::execution_logs::{self, LogMetadata};
use xsha_db::queries::{conversations, results, tasks};

use crate::config::EnvTypeImage;
use crate::container::{self, ContainerError, ContainerSpec, DockerRunner};
use crate::credentials::CredentialMaterializer;
use crate::logstream::{LogBroadcaster, LogSink, LogWriter};
use crate::manager::ExecutionManager;
use crate::result;
use crate::workspace::{WorkspaceError, WorkspaceManager};

/// Orchestrates conversation execution. Cheap to clone behind `Arc`s; one
/// instance serves the scheduler and the user-facing retry/cancel paths.
pub struct ConversationExecutor {
    pool: SqlitePool,
    manager: Arc<ExecutionManager>,
    workspace: Arc<WorkspaceManager>,
    runner: Arc<DockerRunner>,
    broadcaster: Arc<LogBroadcaster>,
    materializer: Arc<CredentialMaterializer>,
    env_types: Vec<EnvTypeImage>,
}

impl ConversationExecutor {
    pub fn new(
        pool: SqlitePool,
        manager: Arc<ExecutionManager>,
        workspace: Arc<WorkspaceManager>,
        runner: Arc<DockerRunner>,
        broadcaster: Arc<LogBroadcaster>,
        materializer: Arc<CredentialMaterializer>,
        env_types: Vec<EnvTypeImage>,
    ) -> Self {
        Self {
            pool,
            manager,
            workspace,
            runner,
            broadcaster,
            materializer,
            env_types,
        }
    }

    pub fn manager(&self) -> &ExecutionManager {
        &self.manager
    }

    pub fn broadcaster(&self) -> &Arc<LogBroadcaster> {
        &self.broadcaster
    }

    /// Validate and launch one pending conversation.
    ///
    /// Returns once the worker task is running (or the conversation was
    /// rejected); it never blocks for the duration of the agent run.
    pub async fn process(&self, pending: PendingConversation) -> Result<()> {
        let conversation = pending.conversation;
        let conversation_id = conversation.id;

        // Preconditions, in order. Each failure terminates the conversation
        // without launching a worker.
        let Some(task) = pending.task else {
            return self
                .fail_before_launch(conversation_id, "missing task info")
                .await;
        };
        let Some(project) = pending.project else {
            return self
                .fail_before_launch(conversation_id, "missing project info")
                .await;
        };
        let Some(environment) = pending.environment else {
            return self
                .fail_before_launch(conversation_id, "no development environment configured")
                .await;
        };

        // pending -> running, guarded. Zero rows means another tick (or a
        // user cancel) got here first; nothing to roll back.
        match conversations::transition_status(
            &self.pool,
            conversation_id,
            ConversationStatus::Pending,
            ConversationStatus::Running,
        )
        .await
        {
            Ok(0) => {
                debug!(conversation_id, "conversation no longer pending, skipping");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                let _ = self
                    .fail_before_launch(conversation_id, "failed to persist running status")
                    .await;
                return Err(e);
            }
        }

        // One log row per conversation: clear any leftover from a prior
        // admission rollback before creating the fresh one.
        let _ = execution_logs::delete_by_conversation(&self.pool, conversation_id).await;
        let exec_log = match execution_logs::create_for_conversation(&self.pool, conversation_id)
            .await
        {
            Ok(log) => log,
            Err(e) => {
                warn!(conversation_id, error = %e, "failed to create execution log, rolling back");
                if let Err(rollback) = conversations::update_status(
                    &self.pool,
                    conversation_id,
                    ConversationStatus::Failed,
                )
                .await
                {
                    error!(conversation_id, error = %rollback, "rollback to failed also failed");
                }
                return Err(e);
            }
        };

        // Admission under the global cap.
        let cancel = CancellationToken::new();
        if !self.manager.admit(conversation_id, cancel.clone()) {
            // Back to pending so the next tick retries.
            if let Err(e) =
                conversations::update_status(&self.pool, conversation_id, ConversationStatus::Pending)
                    .await
            {
                error!(conversation_id, error = %e, "failed to roll back to pending");
            }
            let _ = execution_logs::update_metadata(
                &self.pool,
                exec_log.id,
                &LogMetadata {
                    error_message: Some("concurrency limit"),
                    ..Default::default()
                },
            )
            .await;
            info!(conversation_id, "admission refused, conversation returned to pending");
            return Ok(());
        }

        let worker = ConversationWorker {
            pool: self.pool.clone(),
            manager: Arc::clone(&self.manager),
            workspace: Arc::clone(&self.workspace),
            runner: Arc::clone(&self.runner),
            broadcaster: Arc::clone(&self.broadcaster),
            materializer: Arc::clone(&self.materializer),
            env_types: self.env_types.clone(),
            cancel,
            conversation,
            task,
            project,
            environment,
            credential: pending.credential,
            exec_log_id: exec_log.id,
        };

        tokio::spawn(async move {
            worker.run().await;
        });

        Ok(())
    }

    /// User-initiated retry of a failed or cancelled conversation.
    ///
    /// Prior execution logs (and any stale result) are deleted, the status
    /// reset to `pending`, and the normal execute path re-entered. Any step
    /// failing rolls the status back to `failed`.
    pub async fn retry(&self, conversation_id: i64) -> Result<()> {
        let conversation = conversations::get_conversation(&self.pool, conversation_id)
            .await?
            .with_context(|| format!("conversation {conversation_id} not found"))?;

        if !matches!(
            conversation.status,
            ConversationStatus::Failed | ConversationStatus::Cancelled
        ) {
            bail!(
                "conversation {conversation_id} cannot be retried from status {}",
                conversation.status
            );
        }
        if self.manager.is_running(conversation_id) {
            bail!("conversation {conversation_id} is already running");
        }
        if !self.manager.can_admit() {
            bail!("concurrency limit reached, retry later");
        }

        let relaunch = async {
            execution_logs::delete_by_conversation(&self.pool, conversation_id).await?;
            results::delete_by_conversation(&self.pool, conversation_id).await?;
            conversations::update_status(&self.pool, conversation_id, ConversationStatus::Pending)
                .await?;

            let pending = conversations::get_with_details(&self.pool, conversation_id)
                .await?
                .with_context(|| format!("conversation {conversation_id} disappeared"))?;
            self.process(pending).await
        };

        if let Err(e) = relaunch.await {
            let _ = conversations::update_status(
                &self.pool,
                conversation_id,
                ConversationStatus::Failed,
            )
            .await;
            return Err(e);
        }

        Ok(())
    }

    /// User-initiated cancel of a pending or running conversation.
    pub async fn cancel(&self, conversation_id: i64) -> Result<()> {
        let conversation = conversations::get_conversation(&self.pool, conversation_id)
            .await?
            .with_context(|| format!("conversation {conversation_id} not found"))?;

        if !matches!(
            conversation.status,
            ConversationStatus::Pending | ConversationStatus::Running
        ) {
            bail!(
                "conversation {conversation_id} cannot be cancelled from status {}",
                conversation.status
            );
        }

        // Fires the worker's token when one is registered; a pending
        // conversation has none and the state write below is all there is.
        let fired = self.manager.cancel(conversation_id);
        debug!(conversation_id, fired, "cancel requested");

        conversations::update_status(&self.pool, conversation_id, ConversationStatus::Cancelled)
            .await?;

        // Best-effort workspace reset; the worker's cleanup does the same
        // but a pending conversation has no worker.
        if let Some(task_id) = conversation.task_id {
            if let Ok(Some(task)) = tasks::get_task(&self.pool, task_id).await {
                if let Some(path) = task.workspace_path.filter(|p| !p.is_empty()) {
                    let path = PathBuf::from(path);
                    if path.is_dir() {
                        let dirty = self.workspace.is_dirty(&path).await.unwrap_or(true);
                        if dirty {
                            if let Err(e) = self.workspace.reset_clean(&path).await {
                                warn!(conversation_id, error = %e, "workspace reset after cancel failed");
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Terminate a conversation before any worker was launched: status to
    /// `failed` plus a log row carrying the message.
    async fn fail_before_launch(&self, conversation_id: i64, message: &str) -> Result<()> {
        warn!(conversation_id, message, "conversation rejected before launch");

        conversations::update_status(&self.pool, conversation_id, ConversationStatus::Failed)
            .await?;

        let _ = execution_logs::delete_by_conversation(&self.pool, conversation_id).await;
        let log = execution_logs::create_for_conversation(&self.pool, conversation_id).await?;
        execution_logs::update_metadata(
            &self.pool,
            log.id,
            &LogMetadata {
                completed_at: Some(Utc::now()),
                error_message: Some(message),
                ..Default::default()
            },
        )
        .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Everything one worker task needs, owned.
struct ConversationWorker {
    pool: SqlitePool,
    manager: Arc<ExecutionManager>,
    workspace: Arc<WorkspaceManager>,
    runner: Arc<DockerRunner>,
    broadcaster: Arc<LogBroadcaster>,
    materializer: Arc<CredentialMaterializer>,
    env_types: Vec<EnvTypeImage>,
    cancel: CancellationToken,
    conversation: Conversation,
    task: Task,
    project: Project,
    environment: DevEnvironment,
    credential: Option<GitCredential>,
    exec_log_id: i64,
}

/// What the stages produced, consumed by cleanup.
struct StageOutcome {
    status: ConversationStatus,
    message: String,
    error_message: Option<String>,
    commit_hash: Option<String>,
    workspace_path: Option<PathBuf>,
}

impl StageOutcome {
    fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: ConversationStatus::Failed,
            message: message.clone(),
            error_message: Some(message),
            commit_hash: None,
            workspace_path: None,
        }
    }

    fn cancelled() -> Self {
        Self {
            status: ConversationStatus::Cancelled,
            message: "execution cancelled".to_string(),
            error_message: None,
            commit_hash: None,
            workspace_path: None,
        }
    }
}

impl ConversationWorker {
    async fn run(&self) {
        let writer = LogWriter::new(
            self.pool.clone(),
            self.exec_log_id,
            self.conversation.id,
            Arc::clone(&self.broadcaster),
        );

        let outcome = self.run_stages(&writer).await;
        self.cleanup(outcome).await;
    }

    /// Non-blocking cancellation check between stages. Appends the cancel
    /// marker on first detection.
    async fn check_cancelled(&self, writer: &LogWriter) -> bool {
        if self.cancel.is_cancelled() {
            let _ = writer.append("execution cancelled").await;
            true
        } else {
            false
        }
    }

    async fn run_stages(&self, writer: &LogWriter) -> StageOutcome {
        let conversation_id = self.conversation.id;

        if self.check_cancelled(writer).await {
            return StageOutcome::cancelled();
        }

        // Stage 1: workspace prepare.
        let path = match self
            .workspace
            .get_or_create(self.task.id, self.task.workspace_path.as_deref())
        {
            Ok(path) => path,
            Err(e) => return StageOutcome::failed(format!("workspace error: {e}")),
        };
        if self.task.workspace_path.as_deref().unwrap_or("").is_empty() {
            // Best-effort: a DB error here must not fail the conversation.
            if let Err(e) =
                tasks::set_workspace_path(&self.pool, self.task.id, &path.to_string_lossy()).await
            {
                warn!(conversation_id, error = %e, "failed to record workspace path");
            }
        }
        let with_path = |mut outcome: StageOutcome| {
            outcome.workspace_path = Some(path.clone());
            outcome
        };

        if self.check_cancelled(writer).await {
            return with_path(StageOutcome::cancelled());
        }

        // Stage 2: record started_at.
        if let Err(e) = execution_logs::update_metadata(
            &self.pool,
            self.exec_log_id,
            &LogMetadata {
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        {
            warn!(conversation_id, error = %e, "failed to record started_at");
        }

        // Stage 3: clone if needed.
        if self.workspace.has_git_repo(&path) {
            let _ = writer.append("repo exists, skipping clone").await;
        } else {
            let credential = match &self.credential {
                Some(row) => match self.materializer.materialize(row) {
                    Ok(credential) => Some(credential),
                    Err(e) => {
                        return with_path(StageOutcome::failed(format!("credential error: {e}")));
                    }
                },
                None => None,
            };

            if let Err(e) = self
                .workspace
                .clone_repository(
                    &path,
                    &self.project.repo_url,
                    &self.task.start_branch,
                    credential.as_ref(),
                )
                .await
            {
                return with_path(StageOutcome::failed(format!("clone failed: {e}")));
            }
            let _ = writer.append("repository cloned").await;
        }

        // Work branch, when the task carries one.
        if let Some(branch) = self.task.work_branch.as_deref().filter(|b| !b.is_empty()) {
            if let Err(e) = self
                .workspace
                .ensure_branch(&path, branch, &self.task.start_branch)
                .await
            {
                warn!(conversation_id, branch, error = %e, "failed to ensure work branch");
            }
        }

        if self.check_cancelled(writer).await {
            return with_path(StageOutcome::cancelled());
        }

        // Stage 4: render the container command; persist the audit form.
        let spec = ContainerSpec {
            task_id: self.task.id,
            conversation_id,
            workspace_path: path.clone(),
            env_type: self.environment.env_type.clone(),
            image: container::resolve_image(&self.env_types, &self.environment.env_type),
            cpu_limit: self.environment.cpu_limit,
            memory_limit: self.environment.memory_limit,
            env_vars: self
                .environment
                .env_vars
                .0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            prompt: self.conversation.content.clone(),
        };
        let command = container::build_command(&spec);
        if let Err(e) = execution_logs::update_metadata(
            &self.pool,
            self.exec_log_id,
            &LogMetadata {
                docker_command: Some(&command.audit),
                ..Default::default()
            },
        )
        .await
        {
            warn!(conversation_id, error = %e, "failed to persist docker command");
        }

        if self.check_cancelled(writer).await {
            return with_path(StageOutcome::cancelled());
        }

        // Stage 5: run the agent.
        let sink: Arc<dyn LogSink> = Arc::new(writer.clone());
        match self.runner.execute(&self.cancel, &command, sink).await {
            Ok(()) => {}
            Err(ContainerError::Cancelled) => {
                let _ = writer.append("execution cancelled").await;
                return with_path(StageOutcome::cancelled());
            }
            Err(e) => return with_path(StageOutcome::failed(e.to_string())),
        }

        if self.check_cancelled(writer).await {
            return with_path(StageOutcome::cancelled());
        }

        // Stage 6: commit whatever the agent produced. Never fails the
        // conversation.
        let mut commit_hash = None;
        let message = format!("AI generated changes for conversation {conversation_id}");
        match self.workspace.commit(&path, &message).await {
            Ok(hash) => {
                info!(conversation_id, commit = %hash, "committed agent changes");
                commit_hash = Some(hash);
            }
            Err(WorkspaceError::NothingToCommit) => {
                let _ = writer.append("no changes to commit").await;
            }
            Err(e) => {
                warn!(conversation_id, error = %e, "commit failed, keeping conversation successful");
                let _ = writer.append(&format!("commit failed: {e}")).await;
            }
        }

        StageOutcome {
            status: ConversationStatus::Success,
            message: "execution completed".to_string(),
            error_message: None,
            commit_hash,
            workspace_path: Some(path),
        }
    }

    /// Unconditional teardown: runs for every outcome the stages produce.
    async fn cleanup(&self, outcome: StageOutcome) {
        let conversation_id = self.conversation.id;

        self.manager.release(conversation_id);

        if let Err(e) =
            conversations::update_status(&self.pool, conversation_id, outcome.status).await
        {
            error!(conversation_id, error = %e, "failed to persist final status");
        }

        // Failed/cancelled runs leave the workspace clean for the next
        // conversation of the task.
        if matches!(
            outcome.status,
            ConversationStatus::Failed | ConversationStatus::Cancelled
        ) {
            let path = outcome
                .workspace_path
                .clone()
                .or_else(|| self.task.workspace_path.as_deref().map(PathBuf::from));
            if let Some(path) = path.filter(|p| p.is_dir()) {
                let dirty = match self.workspace.is_dirty(&path).await {
                    Ok(dirty) => dirty,
                    Err(e) => {
                        warn!(conversation_id, error = %e, "dirty check failed, resetting anyway");
                        true
                    }
                };
                if dirty {
                    if let Err(e) = self.workspace.reset_clean(&path).await {
                        warn!(conversation_id, error = %e, "workspace reset failed");
                    }
                }
            }
        }

        if let Some(hash) = &outcome.commit_hash {
            if let Err(e) = conversations::set_commit_hash(&self.pool, conversation_id, hash).await
            {
                error!(conversation_id, error = %e, "failed to persist commit hash");
            }
        }

        // Metadata-only update; the readers have drained but the rule
        // stands: never touch the logs blob from here.
        let meta = LogMetadata {
            completed_at: Some(Utc::now()),
            error_message: outcome.error_message.as_deref(),
            ..Default::default()
        };
        if let Err(e) = execution_logs::update_metadata(&self.pool, self.exec_log_id, &meta).await
        {
            warn!(conversation_id, error = %e, "failed to finalize execution log metadata");
        }

        self.broadcaster.broadcast_status(
            conversation_id,
            &format!("{} - {}", outcome.status, outcome.message),
        );

        // Fresh re-read inside; failures here never change the status.
        if let Err(e) = result::persist_final_result(&self.pool, conversation_id).await {
            warn!(conversation_id, error = %e, "failed to persist conversation result");
        }

        info!(
            conversation_id,
            status = %outcome.status,
            "conversation finished"
        );
    }
}
