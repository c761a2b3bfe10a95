//! End-to-end executor tests: a real git remote on disk, a fake docker
//! client script standing in for the agent container, an in-memory store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use xsha_core::config::ProxyConfig;
use xsha_core::container::DockerRunner;
use xsha_core::credentials::CredentialMaterializer;
use xsha_core::executor::ConversationExecutor;
use xsha_core::logstream::LogBroadcaster;
use xsha_core::manager::ExecutionManager;
use xsha_core::workspace::WorkspaceManager;

use xsha_db::models::{Conversation, ConversationStatus, GitProtocol, PendingConversation};
use xsha_db::queries::{conversations, execution_logs, results, tasks};
use xsha_test_utils::{
    FAKE_DOCKER_FAILURE, FAKE_DOCKER_SUCCESS, create_bare_remote, create_test_pool,
    reload_conversation, seed_conversation, seed_environment, seed_project, seed_task,
    wait_for_status, write_fake_docker,
};

/// Sleepy agent that dirties the workspace before looping, so cancellation
/// has something to reset.
const FAKE_DOCKER_DIRTY_SLEEPY: &str = r#"#!/bin/sh
case "$1" in
  version) exit 0 ;;
  run) ;;
  *) exit 0 ;;
esac
shift
workspace=""
while [ $# -gt 0 ]; do
  case "$1" in
    -v) workspace="${2%%:*}"; shift 2 ;;
    *) shift ;;
  esac
done
if [ -n "$workspace" ]; then
  echo "junk" > "$workspace/half-done.txt"
fi
i=0
while [ $i -lt 600 ]; do
  echo "tick $i"
  i=$((i + 1))
  sleep 0.1
done
exit 0
"#;

struct TestEngine {
    pool: sqlx::SqlitePool,
    manager: Arc<ExecutionManager>,
    workspace: Arc<WorkspaceManager>,
    executor: Arc<ConversationExecutor>,
    remote_path: PathBuf,
    workspace_root: PathBuf,
    _tmp: tempfile::TempDir,
    _remote_dir: tempfile::TempDir,
}

impl TestEngine {
    async fn with_script(script: &str, cap: usize) -> Self {
        let pool = create_test_pool().await;
        let tmp = tempfile::TempDir::new().unwrap();
        let (remote_dir, remote_path) = create_bare_remote();

        let workspace_root = tmp.path().join("workspaces");
        let manager = Arc::new(ExecutionManager::new(cap));
        let workspace = Arc::new(WorkspaceManager::new(
            &workspace_root,
            Duration::from_secs(60),
            false,
            ProxyConfig::default(),
        ));

        let engine = Self {
            executor: Self::build_executor(&pool, &manager, &workspace, tmp.path(), script),
            pool,
            manager,
            workspace,
            remote_path,
            workspace_root,
            _tmp: tmp,
            _remote_dir: remote_dir,
        };
        engine
    }

    /// A second executor over the same store/manager/workspaces but a
    /// different agent script. Used by the retry test.
    fn executor_with_script(&self, script: &str) -> Arc<ConversationExecutor> {
        let dir = tempfile::TempDir::new().unwrap();
        let executor =
            Self::build_executor(&self.pool, &self.manager, &self.workspace, dir.path(), script);
        // Leak the script dir for the test's lifetime.
        std::mem::forget(dir);
        executor
    }

    fn build_executor(
        pool: &sqlx::SqlitePool,
        manager: &Arc<ExecutionManager>,
        workspace: &Arc<WorkspaceManager>,
        script_dir: &std::path::Path,
        script: &str,
    ) -> Arc<ConversationExecutor> {
        let docker = write_fake_docker(script_dir, script);
        Arc::new(ConversationExecutor::new(
            pool.clone(),
            Arc::clone(manager),
            Arc::clone(workspace),
            Arc::new(DockerRunner::with_binary(
                docker.to_string_lossy(),
                Duration::from_secs(60),
            )),
            Arc::new(LogBroadcaster::default()),
            Arc::new(CredentialMaterializer::new("executor-test-key").unwrap()),
            vec![],
        ))
    }

    /// Seed project/environment/task/conversation rows wired to the local
    /// remote.
    async fn seed(
        &self,
        env_vars: HashMap<String, String>,
        prompt: &str,
    ) -> Conversation {
        let project = seed_project(
            &self.pool,
            self.remote_path.to_str().unwrap(),
            GitProtocol::Https,
            None,
        )
        .await;
        let environment =
            seed_environment(&self.pool, "claude_code", Some(1.0), Some(1024), env_vars).await;
        let task = seed_task(&self.pool, Some(project.id), Some(environment.id), "main").await;
        seed_conversation(&self.pool, Some(task.id), prompt).await
    }

    async fn details(&self, conversation_id: i64) -> PendingConversation {
        conversations::get_with_details(&self.pool, conversation_id)
            .await
            .unwrap()
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_commits_and_records_result() {
    let engine = TestEngine::with_script(FAKE_DOCKER_SUCCESS, 5).await;
    let env_vars = HashMap::from([("API_TOKEN".to_string(), "supersecret00".to_string())]);
    let conversation = engine
        .seed(env_vars, r#"Add a health endpoint; don't break "anything""#)
        .await;

    engine
        .executor
        .process(engine.details(conversation.id).await)
        .await
        .unwrap();

    let finished = wait_for_status(
        &engine.pool,
        conversation.id,
        ConversationStatus::Success,
        Duration::from_secs(20),
    )
    .await;

    // Commit hash set only on success, full git hash.
    let hash = finished.commit_hash.expect("commit hash should be set");
    assert_eq!(hash.len(), 40);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

    // Workspace recorded on the task and populated.
    let task = tasks::get_task(&engine.pool, conversation.task_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    let workspace_path = PathBuf::from(task.workspace_path.expect("workspace path recorded"));
    assert!(workspace_path.starts_with(&engine.workspace_root));
    assert!(workspace_path.join(".git").is_dir());
    assert!(workspace_path.join("AGENT_NOTES.md").exists());
    assert!(!engine.workspace.is_dirty(&workspace_path).await.unwrap());

    // Execution log: stamped lines, audit command with masked env value.
    let log = execution_logs::get_by_conversation(&engine.pool, conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert!(log.logs.contains("STDOUT: working on it"), "logs: {}", log.logs);
    assert!(log.logs.contains(r#""type":"result""#));
    assert!(log.started_at.is_some());
    assert!(log.completed_at.is_some());
    assert!(log.error_message.is_none());
    let audit = log.docker_command.expect("audit command persisted");
    assert!(audit.contains("--cpus=1.00"), "audit: {audit}");
    assert!(audit.contains("--memory=1024m"));
    assert!(audit.contains("API_TOKEN=su*********00"));
    assert!(!audit.contains("supersecret00"));
    assert!(audit.contains("xsha-task-"));

    // Exactly one result row, from the agent's final record.
    let result = results::get_by_conversation(&engine.pool, conversation.id)
        .await
        .unwrap()
        .expect("result row should exist");
    assert_eq!(result.session_id, "sess-fixture");
    assert_eq!(result.subtype, "success");
    assert!(!result.is_error);

    // Slot released.
    assert_eq!(engine.manager.running_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_conversation_reuses_the_workspace() {
    let engine = TestEngine::with_script(FAKE_DOCKER_SUCCESS, 5).await;
    let first = engine.seed(HashMap::new(), "first prompt").await;

    engine
        .executor
        .process(engine.details(first.id).await)
        .await
        .unwrap();
    wait_for_status(
        &engine.pool,
        first.id,
        ConversationStatus::Success,
        Duration::from_secs(20),
    )
    .await;

    let task_id = first.task_id.unwrap();
    let recorded = tasks::get_task(&engine.pool, task_id)
        .await
        .unwrap()
        .unwrap()
        .workspace_path
        .unwrap();

    let second = seed_conversation(&engine.pool, Some(task_id), "second prompt").await;
    engine
        .executor
        .process(engine.details(second.id).await)
        .await
        .unwrap();
    wait_for_status(
        &engine.pool,
        second.id,
        ConversationStatus::Success,
        Duration::from_secs(20),
    )
    .await;

    let log = execution_logs::get_by_conversation(&engine.pool, second.id)
        .await
        .unwrap()
        .unwrap();
    assert!(
        log.logs.contains("repo exists, skipping clone"),
        "logs: {}",
        log.logs
    );

    let task = tasks::get_task(&engine.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.workspace_path.unwrap(), recorded, "workspace path is stable");
}

#[tokio::test]
async fn missing_references_fail_in_order() {
    let engine = TestEngine::with_script(FAKE_DOCKER_SUCCESS, 5).await;

    // No task at all.
    let no_task = seed_conversation(&engine.pool, None, "x").await;
    engine
        .executor
        .process(engine.details(no_task.id).await)
        .await
        .unwrap();
    let log = execution_logs::get_by_conversation(&engine.pool, no_task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.error_message.as_deref(), Some("missing task info"));
    assert_eq!(
        reload_conversation(&engine.pool, no_task.id).await.status,
        ConversationStatus::Failed
    );

    // Task without a project.
    let task = seed_task(&engine.pool, None, None, "main").await;
    let no_project = seed_conversation(&engine.pool, Some(task.id), "x").await;
    engine
        .executor
        .process(engine.details(no_project.id).await)
        .await
        .unwrap();
    let log = execution_logs::get_by_conversation(&engine.pool, no_project.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.error_message.as_deref(), Some("missing project info"));

    // Task with a project but no environment.
    let project = seed_project(
        &engine.pool,
        engine.remote_path.to_str().unwrap(),
        GitProtocol::Https,
        None,
    )
    .await;
    let task = seed_task(&engine.pool, Some(project.id), None, "main").await;
    let no_env = seed_conversation(&engine.pool, Some(task.id), "x").await;
    engine
        .executor
        .process(engine.details(no_env.id).await)
        .await
        .unwrap();
    let log = execution_logs::get_by_conversation(&engine.pool, no_env.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        log.error_message.as_deref(),
        Some("no development environment configured")
    );

    // Nothing got a workspace or a docker invocation.
    assert!(!engine.workspace_root.exists());
}

#[tokio::test]
async fn admission_refusal_returns_to_pending() {
    let engine = TestEngine::with_script(FAKE_DOCKER_SUCCESS, 0).await;
    let conversation = engine.seed(HashMap::new(), "x").await;

    engine
        .executor
        .process(engine.details(conversation.id).await)
        .await
        .unwrap();

    // Back to pending for the next tick; the log row records why.
    assert_eq!(
        reload_conversation(&engine.pool, conversation.id).await.status,
        ConversationStatus::Pending
    );
    let log = execution_logs::get_by_conversation(&engine.pool, conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.error_message.as_deref(), Some("concurrency limit"));
    assert_eq!(
        execution_logs::count_by_conversation(&engine.pool, conversation.id)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_agent_marks_conversation_failed() {
    let engine = TestEngine::with_script(FAKE_DOCKER_FAILURE, 5).await;
    let conversation = engine.seed(HashMap::new(), "x").await;

    engine
        .executor
        .process(engine.details(conversation.id).await)
        .await
        .unwrap();
    let finished = wait_for_status(
        &engine.pool,
        conversation.id,
        ConversationStatus::Failed,
        Duration::from_secs(20),
    )
    .await;

    assert!(finished.commit_hash.is_none());

    let log = execution_logs::get_by_conversation(&engine.pool, conversation.id)
        .await
        .unwrap()
        .unwrap();
    let error = log.error_message.expect("error message recorded");
    assert!(error.contains("agent exploded"), "error was {error:?}");
    assert!(log.logs.contains("STDERR: agent exploded"));

    assert!(
        results::get_by_conversation(&engine.pool, conversation.id)
            .await
            .unwrap()
            .is_none(),
        "failed run emits no result record"
    );
    assert_eq!(engine.manager.running_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_during_run_resets_the_workspace() {
    let engine = TestEngine::with_script(FAKE_DOCKER_DIRTY_SLEEPY, 5).await;
    let conversation = engine.seed(HashMap::new(), "x").await;

    engine
        .executor
        .process(engine.details(conversation.id).await)
        .await
        .unwrap();

    // Wait until the agent is demonstrably streaming.
    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    loop {
        if let Some(log) = execution_logs::get_by_conversation(&engine.pool, conversation.id)
            .await
            .unwrap()
        {
            if log.logs.contains("tick") {
                break;
            }
        }
        assert!(std::time::Instant::now() < deadline, "agent never started");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(engine.manager.is_running(conversation.id));

    let requested = std::time::Instant::now();
    engine.executor.cancel(conversation.id).await.unwrap();

    wait_for_status(
        &engine.pool,
        conversation.id,
        ConversationStatus::Cancelled,
        Duration::from_secs(15),
    )
    .await;
    assert!(
        requested.elapsed() < Duration::from_secs(15),
        "cancel latency {:?}",
        requested.elapsed()
    );

    // Worker cleanup finishes shortly after: slot free, workspace clean,
    // no result row.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while engine.manager.running_count() > 0 {
        assert!(std::time::Instant::now() < deadline, "slot never released");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let task = tasks::get_task(&engine.pool, conversation.task_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    let workspace_path = PathBuf::from(task.workspace_path.unwrap());
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if !workspace_path.join("half-done.txt").exists()
            && !engine.workspace.is_dirty(&workspace_path).await.unwrap()
        {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "workspace never reset");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(
        results::get_by_conversation(&engine.pool, conversation.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn cancel_pending_conversation_is_immediate() {
    let engine = TestEngine::with_script(FAKE_DOCKER_SUCCESS, 5).await;
    let conversation = engine.seed(HashMap::new(), "x").await;

    engine.executor.cancel(conversation.id).await.unwrap();
    assert_eq!(
        reload_conversation(&engine.pool, conversation.id).await.status,
        ConversationStatus::Cancelled
    );

    // A stale tick that still holds the conversation loses the guarded
    // pending->running transition and changes nothing.
    let details = engine.details(conversation.id).await;
    engine.executor.process(details).await.unwrap();
    assert_eq!(
        reload_conversation(&engine.pool, conversation.id).await.status,
        ConversationStatus::Cancelled
    );
    assert_eq!(
        execution_logs::count_by_conversation(&engine.pool, conversation.id)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn cancel_rejects_terminal_conversations() {
    let engine = TestEngine::with_script(FAKE_DOCKER_SUCCESS, 5).await;
    let conversation = engine.seed(HashMap::new(), "x").await;
    conversations::update_status(&engine.pool, conversation.id, ConversationStatus::Success)
        .await
        .unwrap();

    let err = engine.executor.cancel(conversation.id).await.unwrap_err();
    assert!(err.to_string().contains("cannot be cancelled"));
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_after_failure_runs_clean(){
    let engine = TestEngine::with_script(FAKE_DOCKER_FAILURE, 5).await;
    let conversation = engine.seed(HashMap::new(), "x").await;

    engine
        .executor
        .process(engine.details(conversation.id).await)
        .await
        .unwrap();
    wait_for_status(
        &engine.pool,
        conversation.id,
        ConversationStatus::Failed,
        Duration::from_secs(20),
    )
    .await;

    // Retry through an engine whose agent succeeds.
    let fixed = engine.executor_with_script(FAKE_DOCKER_SUCCESS);
    fixed.retry(conversation.id).await.unwrap();

    let finished = wait_for_status(
        &engine.pool,
        conversation.id,
        ConversationStatus::Success,
        Duration::from_secs(20),
    )
    .await;
    assert!(finished.commit_hash.is_some());

    // Exactly one (fresh) log row and exactly one result.
    assert_eq!(
        execution_logs::count_by_conversation(&engine.pool, conversation.id)
            .await
            .unwrap(),
        1
    );
    let log = execution_logs::get_by_conversation(&engine.pool, conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!log.logs.contains("agent exploded"), "old log survived retry");
    let result = results::get_by_conversation(&engine.pool, conversation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.session_id, "sess-fixture");
}

#[tokio::test]
async fn retry_rejects_non_terminal_and_busy_states() {
    let engine = TestEngine::with_script(FAKE_DOCKER_SUCCESS, 5).await;
    let conversation = engine.seed(HashMap::new(), "x").await;

    // Pending conversations are not retryable.
    let err = engine.executor.retry(conversation.id).await.unwrap_err();
    assert!(err.to_string().contains("cannot be retried"));

    // Nor is anything when the cap is exhausted.
    let blocked = TestEngine::with_script(FAKE_DOCKER_SUCCESS, 0).await;
    let their_conversation = blocked.seed(HashMap::new(), "x").await;
    conversations::update_status(
        &blocked.pool,
        their_conversation.id,
        ConversationStatus::Failed,
    )
    .await
    .unwrap();
    let err = blocked.executor.retry(their_conversation.id).await.unwrap_err();
    assert!(err.to_string().contains("concurrency limit"));
}
