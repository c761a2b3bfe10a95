//! Agent container command construction and supervised execution.
//!
//! The runner executes an argv directly through `tokio::process::Command`;
//! no intermediate shell ever sees the prompt. Two single-string renderings
//! of the same command line are still produced: a display form whose
//! shell-quoting is lossless, and an audit form with every `-e` value
//! masked, which is what lands in `execution_log.docker_command`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EnvTypeImage;
use crate::logstream::LogSink;

/// Image used when the env-type table has no entry for a type.
pub const FALLBACK_IMAGE: &str = "claude-code:latest";

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Max bytes of stderr retained for the failure message.
const STDERR_TAIL_MAX: usize = 1000;

/// Errors from the container runner.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// `docker version` preflight failed or timed out.
    #[error("docker is unavailable: {0}")]
    DockerUnavailable(String),

    #[error("failed to start agent container: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to wait on agent container: {0}")]
    Wait(#[source] std::io::Error),

    /// The agent process exited non-zero; carries the stderr tail.
    #[error("agent exited with status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("agent execution timed out after {seconds}s")]
    TimedOut { seconds: u64 },

    #[error("agent execution cancelled")]
    Cancelled,
}

/// Everything needed to render one agent container invocation.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub task_id: i64,
    pub conversation_id: i64,
    pub workspace_path: std::path::PathBuf,
    pub env_type: String,
    pub image: String,
    /// CPU limit in decimal cores.
    pub cpu_limit: Option<f64>,
    /// Memory limit in MiB.
    pub memory_limit: Option<i64>,
    pub env_vars: Vec<(String, String)>,
    /// The conversation content handed to the agent.
    pub prompt: String,
}

/// A rendered container command: the argv handed to the docker client plus
/// the display and audit string forms.
#[derive(Debug, Clone)]
pub struct DockerCommand {
    pub container_name: String,
    /// Arguments after the docker binary itself, starting with `run`.
    pub args: Vec<String>,
    /// Full command line, shell-quoted losslessly.
    pub display: String,
    /// Same line with env values masked; persisted for operator review.
    pub audit: String,
}

/// Look up the image for an env type, falling back to [`FALLBACK_IMAGE`]
/// for unknown types or an empty table.
pub fn resolve_image(types: &[EnvTypeImage], env_type: &str) -> String {
    types
        .iter()
        .find(|t| t.key == env_type)
        .map(|t| t.image.clone())
        .unwrap_or_else(|| FALLBACK_IMAGE.to_string())
}

/// Render the `docker run` invocation for a spec.
pub fn build_command(spec: &ContainerSpec) -> DockerCommand {
    let container_name = format!(
        "xsha-task-{}-conv-{}",
        spec.task_id, spec.conversation_id
    );

    // (execution arg, audit arg) pairs; they differ only for -e values.
    fn same(arg: impl Into<String>) -> (String, String) {
        let arg = arg.into();
        (arg.clone(), arg)
    }

    let mut pairs: Vec<(String, String)> = vec![
        same("run"),
        same("--rm"),
        same("-i"),
        same(format!("--name={container_name}")),
        same("-v"),
        same(format!("{}:/app", spec.workspace_path.display())),
    ];

    if let Some(cpus) = spec.cpu_limit {
        pairs.push(same(format!("--cpus={cpus:.2}")));
    }
    if let Some(memory) = spec.memory_limit {
        pairs.push(same(format!("--memory={memory}m")));
    }

    let mut env_vars = spec.env_vars.clone();
    env_vars.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, value) in &env_vars {
        pairs.push(same("-e"));
        pairs.push((
            format!("{key}={value}"),
            format!("{key}={}", mask_secret(value)),
        ));
    }

    pairs.push(same(spec.image.clone()));
    for arg in agent_args(&spec.env_type, &spec.prompt) {
        pairs.push(same(arg));
    }

    let display = render_line(pairs.iter().map(|(exec, _)| exec.as_str()));
    let audit = render_line(pairs.iter().map(|(_, audit)| audit.as_str()));
    let args = pairs.into_iter().map(|(exec, _)| exec).collect();

    DockerCommand {
        container_name,
        args,
        display,
        audit,
    }
}

/// Agent argv by env type. Unknown types get the `claude_code` convention.
fn agent_args(env_type: &str, prompt: &str) -> Vec<String> {
    match env_type {
        "opencode" | "gemini_cli" => vec![prompt.to_string()],
        _ => vec![
            "claude".to_string(),
            "-p".to_string(),
            "--output-format=stream-json".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--verbose".to_string(),
            prompt.to_string(),
        ],
    }
}

fn render_line<'a>(args: impl Iterator<Item = &'a str>) -> String {
    let mut line = String::from("docker");
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line
}

/// Quote a string for `sh`. Plain words pass through; anything else is
/// double-quoted with `\\`, `"`, `$` and backtick escaped, which survives
/// `sh -c` losslessly.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-/:=@%+,".contains(c));
    if plain {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Mask an env value for the audit rendering: first and last two characters
/// kept, the middle replaced with `*`. Short values are fully masked.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let mut out = String::new();
    out.extend(&chars[..2]);
    out.push_str(&"*".repeat(chars.len() - 4));
    out.extend(&chars[chars.len() - 2..]);
    out
}

/// Runs rendered commands against a docker client binary.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    docker_binary: String,
    execution_timeout: Duration,
}

impl DockerRunner {
    /// Runner using `docker` from `$PATH`.
    pub fn new(execution_timeout: Duration) -> Self {
        Self::with_binary("docker", execution_timeout)
    }

    /// Runner with an explicit client binary path. Useful for testing or
    /// when the docker client is installed in a non-standard location.
    pub fn with_binary(binary: impl Into<String>, execution_timeout: Duration) -> Self {
        Self {
            docker_binary: binary.into(),
            execution_timeout,
        }
    }

    /// `docker version` with a short budget; the standard first failure
    /// when the daemon is down or the socket is not mounted.
    pub async fn preflight(&self) -> Result<(), ContainerError> {
        let output = tokio::time::timeout(PREFLIGHT_TIMEOUT, {
            let mut cmd = Command::new(&self.docker_binary);
            cmd.arg("version")
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true);
            cmd.output()
        })
        .await;

        match output {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(ContainerError::DockerUnavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Ok(Err(e)) => Err(ContainerError::DockerUnavailable(e.to_string())),
            Err(_) => Err(ContainerError::DockerUnavailable(
                "docker version timed out".to_string(),
            )),
        }
    }

    /// Run the agent container to completion, streaming both pipes into the
    /// sink. Each line is stamped `[HH:MM:SS] STDOUT:`/`STDERR:` before it
    /// is handed over. On cancellation or timeout the container is stopped
    /// and removed, and the client process killed; cleanup also runs when
    /// waiting on the process fails.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        command: &DockerCommand,
        sink: Arc<dyn LogSink>,
    ) -> Result<(), ContainerError> {
        self.preflight().await?;

        let mut child = Command::new(&self.docker_binary)
            .args(&command.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ContainerError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(read_lines(pipe, "STDOUT", Arc::clone(&sink), None)));
        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let stderr = child.stderr.take().map(|pipe| {
            tokio::spawn(read_lines(
                pipe,
                "STDERR",
                Arc::clone(&sink),
                Some(Arc::clone(&stderr_tail)),
            ))
        });

        enum Outcome {
            Exited(std::io::Result<std::process::ExitStatus>),
            Cancelled,
            TimedOut,
        }

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(self.execution_timeout) => Outcome::TimedOut,
        };

        let name = &command.container_name;
        match &outcome {
            Outcome::Exited(Ok(status)) if status.success() => {}
            Outcome::Exited(Ok(_)) => {
                // --rm removes the container on exit; sweep anyway in case
                // the daemon did not.
                self.stop_and_remove(name).await;
            }
            Outcome::Exited(Err(_)) => {
                self.stop_and_remove(name).await;
            }
            Outcome::Cancelled | Outcome::TimedOut => {
                self.stop_and_remove(name).await;
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        // Readers finish at pipe EOF; all lines are persisted before we
        // hand control back to the executor.
        drain_readers(stdout, stderr).await;

        match outcome {
            Outcome::Exited(Ok(status)) if status.success() => Ok(()),
            Outcome::Exited(Ok(status)) => {
                let stderr = stderr_tail.lock().await.trim().to_string();
                Err(ContainerError::NonZeroExit {
                    code: status.code().unwrap_or(-1),
                    stderr,
                })
            }
            Outcome::Exited(Err(e)) => Err(ContainerError::Wait(e)),
            Outcome::Cancelled => Err(ContainerError::Cancelled),
            Outcome::TimedOut => Err(ContainerError::TimedOut {
                seconds: self.execution_timeout.as_secs(),
            }),
        }
    }

    /// `docker stop` then `docker rm -f`, both with short budgets.
    /// "No such container" is not an error.
    async fn stop_and_remove(&self, name: &str) {
        for (subcommand, args, timeout) in [
            ("stop", vec!["stop", name], STOP_TIMEOUT),
            ("rm", vec!["rm", "-f", name], REMOVE_TIMEOUT),
        ] {
            let output = tokio::time::timeout(timeout, {
                let mut cmd = Command::new(&self.docker_binary);
                cmd.args(&args)
                    .stdin(std::process::Stdio::null())
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::piped())
                    .kill_on_drop(true);
                cmd.output()
            })
            .await;

            match output {
                Ok(Ok(output)) if output.status.success() => {}
                Ok(Ok(output)) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    if !stderr.contains("No such container") {
                        warn!(container = name, subcommand, stderr = %stderr.trim(), "container cleanup failed");
                    }
                }
                Ok(Err(e)) => {
                    warn!(container = name, subcommand, error = %e, "container cleanup failed");
                }
                Err(_) => {
                    warn!(container = name, subcommand, "container cleanup timed out");
                }
            }
        }
    }
}

async fn drain_readers(
    stdout: Option<tokio::task::JoinHandle<()>>,
    stderr: Option<tokio::task::JoinHandle<()>>,
) {
    if let Some(handle) = stdout {
        let _ = handle.await;
    }
    if let Some(handle) = stderr {
        let _ = handle.await;
    }
}

/// Read one pipe line by line, stamping and forwarding to the sink.
/// Stderr additionally feeds the bounded tail buffer.
async fn read_lines<R: AsyncRead + Unpin>(
    pipe: R,
    label: &'static str,
    sink: Arc<dyn LogSink>,
    tail: Option<Arc<Mutex<String>>>,
) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let stamped = format!("[{}] {label}: {line}", Local::now().format("%H:%M:%S"));
                if let Err(e) = sink.append(&stamped).await {
                    warn!(error = %e, "failed to persist agent log line");
                }
                if let Some(tail) = &tail {
                    let mut buffer = tail.lock().await;
                    buffer.push_str(&line);
                    buffer.push('\n');
                    if buffer.len() > STDERR_TAIL_MAX {
                        let mut cut = buffer.len() - STDERR_TAIL_MAX;
                        while !buffer.is_char_boundary(cut) {
                            cut += 1;
                        }
                        buffer.drain(..cut);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "agent {label} pipe closed with error");
                break;
            }
        }
    }
}
