//! Shared test utilities for integration tests.
//!
//! Provides in-memory SQLite pools with migrations applied, seeded fixture
//! rows, throwaway git repositories driven through the real `git` binary,
//! and a fake `docker` shell script the container runner can be pointed at.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use sqlx::SqlitePool;

use xsha_db::config::DbConfig;
use xsha_db::models::{
    Conversation, CredentialKind, DevEnvironment, GitCredential, GitProtocol, Project, Task,
};
use xsha_db::pool;
use xsha_db::queries::{conversations, credentials, environments, projects, tasks};

/// Create an in-memory database with migrations applied.
///
/// Each call returns an independent database; there is nothing to tear down.
pub async fn create_test_pool() -> SqlitePool {
    let config = DbConfig::new(DbConfig::MEMORY_URL);
    let pool = pool::create_pool(&config)
        .await
        .expect("failed to open in-memory database");
    pool::run_migrations(&pool)
        .await
        .expect("migrations should succeed");
    pool
}

// ---------------------------------------------------------------------------
// Fixture rows
// ---------------------------------------------------------------------------

pub async fn seed_project(
    pool: &SqlitePool,
    repo_url: &str,
    protocol: GitProtocol,
    credential_id: Option<i64>,
) -> Project {
    projects::insert_project(pool, "fixture-project", repo_url, protocol, credential_id)
        .await
        .expect("failed to seed project")
}

pub async fn seed_credential(
    pool: &SqlitePool,
    cred_type: CredentialKind,
    username: &str,
    secret_enc: &str,
    private_key_enc: Option<&str>,
) -> GitCredential {
    credentials::insert_credential(
        pool,
        "fixture-credential",
        cred_type,
        username,
        secret_enc,
        private_key_enc,
        None,
    )
    .await
    .expect("failed to seed credential")
}

pub async fn seed_environment(
    pool: &SqlitePool,
    env_type: &str,
    cpu_limit: Option<f64>,
    memory_limit: Option<i64>,
    env_vars: HashMap<String, String>,
) -> DevEnvironment {
    environments::insert_environment(
        pool,
        "fixture-environment",
        env_type,
        cpu_limit,
        memory_limit,
        env_vars,
    )
    .await
    .expect("failed to seed environment")
}

pub async fn seed_task(
    pool: &SqlitePool,
    project_id: Option<i64>,
    dev_environment_id: Option<i64>,
    start_branch: &str,
) -> Task {
    tasks::insert_task(
        pool,
        "fixture-task",
        project_id,
        dev_environment_id,
        start_branch,
        None,
    )
    .await
    .expect("failed to seed task")
}

pub async fn seed_conversation(
    pool: &SqlitePool,
    task_id: Option<i64>,
    content: &str,
) -> Conversation {
    conversations::insert_conversation(pool, task_id, content)
        .await
        .expect("failed to seed conversation")
}

/// Seed a full pending conversation: project (no credential), environment,
/// task and conversation. Returns the conversation.
pub async fn seed_runnable_conversation(
    pool: &SqlitePool,
    repo_url: &str,
    env_type: &str,
    prompt: &str,
) -> Conversation {
    let project = seed_project(pool, repo_url, GitProtocol::Https, None).await;
    let environment = seed_environment(pool, env_type, Some(1.0), Some(1024), HashMap::new()).await;
    let task = seed_task(pool, Some(project.id), Some(environment.id), "main").await;
    seed_conversation(pool, Some(task.id), prompt).await
}

/// Reload a conversation row.
pub async fn reload_conversation(pool: &SqlitePool, id: i64) -> Conversation {
    conversations::get_conversation(pool, id)
        .await
        .expect("failed to reload conversation")
        .expect("conversation row should exist")
}

/// Poll until the conversation reaches a terminal status, panicking after
/// `timeout`.
pub async fn wait_for_terminal(
    pool: &SqlitePool,
    id: i64,
    timeout: std::time::Duration,
) -> Conversation {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let conversation = reload_conversation(pool, id).await;
        if conversation.status.is_terminal() {
            return conversation;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "conversation {id} did not reach a terminal status within {timeout:?} \
             (currently {})",
            conversation.status
        );
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}

/// Poll until the conversation reaches `status`, panicking after `timeout`.
pub async fn wait_for_status(
    pool: &SqlitePool,
    id: i64,
    status: xsha_db::models::ConversationStatus,
    timeout: std::time::Duration,
) -> Conversation {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let conversation = reload_conversation(pool, id).await;
        if conversation.status == status {
            return conversation;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "conversation {id} did not reach {status} within {timeout:?} \
             (currently {})",
            conversation.status
        );
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}

// ---------------------------------------------------------------------------
// Git repositories
// ---------------------------------------------------------------------------

/// Create a temporary git repository with one commit on `main`.
///
/// Returns the tempdir (keep it alive) and the repo path.
pub fn create_temp_git_repo() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    run_git(&repo_path, &["init", "-b", "main"]);
    run_git(&repo_path, &["config", "user.email", "test@xsha.dev"]);
    run_git(&repo_path, &["config", "user.name", "XSHA Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test\n").expect("failed to write README");
    run_git(&repo_path, &["add", "."]);
    run_git(&repo_path, &["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Create a bare repository seeded with one commit on `main`, usable as a
/// clone source and push target.
pub fn create_bare_remote() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("failed to create temp dir");
    let bare_path = dir.path().join("remote.git");
    std::fs::create_dir(&bare_path).expect("failed to create bare dir");
    run_git(&bare_path, &["init", "--bare", "-b", "main"]);

    // Seed it through a scratch clone.
    let work = dir.path().join("seed");
    let status = Command::new("git")
        .args(["clone", bare_path.to_str().unwrap(), work.to_str().unwrap()])
        .output()
        .expect("failed to run git clone");
    assert!(
        status.status.success(),
        "git clone failed: {}",
        String::from_utf8_lossy(&status.stderr)
    );
    run_git(&work, &["config", "user.email", "test@xsha.dev"]);
    run_git(&work, &["config", "user.name", "XSHA Test"]);
    std::fs::write(work.join("README.md"), "# Remote\n").expect("failed to write README");
    run_git(&work, &["add", "."]);
    run_git(&work, &["commit", "-m", "Initial commit"]);
    run_git(&work, &["push", "origin", "HEAD:main"]);

    (dir, bare_path)
}

/// Run a git command in `dir`, asserting success.
pub fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Capture a git command's stdout in `dir`, asserting success.
pub fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

// ---------------------------------------------------------------------------
// Fake docker
// ---------------------------------------------------------------------------

/// A fake `docker` that answers the preflight, ignores stop/rm, writes one
/// file into the mounted workspace and prints a final result record.
pub const FAKE_DOCKER_SUCCESS: &str = r#"#!/bin/sh
cmd="$1"
case "$cmd" in
  version) echo "Docker version 0.0.0-fake"; exit 0 ;;
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
  echo "agent artifact" > "$workspace/AGENT_NOTES.md"
fi
echo "working on it"
echo '{"type":"result","subtype":"success","is_error":false,"session_id":"sess-fixture"}'
exit 0
"#;

/// A fake `docker` that emits one line and exits non-zero with stderr.
pub const FAKE_DOCKER_FAILURE: &str = r#"#!/bin/sh
case "$1" in
  version) exit 0 ;;
  run) ;;
  *) exit 0 ;;
esac
echo "starting up"
echo "agent exploded" >&2
exit 1
"#;

/// A fake `docker` whose run phase streams lines until killed; stop/rm are
/// answered immediately so the cancel path completes.
pub const FAKE_DOCKER_SLEEPY: &str = r#"#!/bin/sh
case "$1" in
  version) exit 0 ;;
  run) ;;
  *) exit 0 ;;
esac
i=0
while [ $i -lt 300 ]; do
  echo "tick $i"
  i=$((i + 1))
  sleep 0.1
done
exit 0
"#;

/// Write `script` as an executable `docker` file under `dir` and return its
/// path, suitable for `DockerRunner::with_binary`.
pub fn write_fake_docker(dir: &Path, script: &str) -> PathBuf {
    let path = dir.join("docker");
    std::fs::write(&path, script).expect("failed to write fake docker");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod fake docker");
    }
    path
}
