use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a conversation.
///
/// Created `pending` by the API layer; mutated exclusively by the executor.
/// `success`, `failed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ConversationStatus {
    /// True for `success`, `failed` and `cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ConversationStatus {
    type Err = ConversationStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ConversationStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ConversationStatus`] string.
#[derive(Debug, Clone)]
pub struct ConversationStatusParseError(pub String);

impl fmt::Display for ConversationStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid conversation status: {:?}", self.0)
    }
}

impl std::error::Error for ConversationStatusParseError {}

// ---------------------------------------------------------------------------

/// Transport protocol used to reach a project's repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GitProtocol {
    Https,
    Ssh,
}

impl fmt::Display for GitProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Https => "https",
            Self::Ssh => "ssh",
        };
        f.write_str(s)
    }
}

impl FromStr for GitProtocol {
    type Err = GitProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "https" => Ok(Self::Https),
            "ssh" => Ok(Self::Ssh),
            other => Err(GitProtocolParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`GitProtocol`] string.
#[derive(Debug, Clone)]
pub struct GitProtocolParseError(pub String);

impl fmt::Display for GitProtocolParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid git protocol: {:?}", self.0)
    }
}

impl std::error::Error for GitProtocolParseError {}

// ---------------------------------------------------------------------------

/// Kind of stored git credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Password,
    Token,
    SshKey,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Password => "password",
            Self::Token => "token",
            Self::SshKey => "ssh_key",
        };
        f.write_str(s)
    }
}

impl FromStr for CredentialKind {
    type Err = CredentialKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "password" => Ok(Self::Password),
            "token" => Ok(Self::Token),
            "ssh_key" => Ok(Self::SshKey),
            other => Err(CredentialKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CredentialKind`] string.
#[derive(Debug, Clone)]
pub struct CredentialKindParseError(pub String);

impl fmt::Display for CredentialKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid credential kind: {:?}", self.0)
    }
}

impl std::error::Error for CredentialKindParseError {}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A source repository. Read-only to the execution engine.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub repo_url: String,
    pub protocol: GitProtocol,
    pub credential_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// An encrypted git credential row. Secrets stay encrypted at rest; the
/// execution engine decrypts them through the credential materializer only.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GitCredential {
    pub id: i64,
    pub name: String,
    pub cred_type: CredentialKind,
    pub username: String,
    /// AES-encrypted password or token.
    pub secret_enc: String,
    /// AES-encrypted SSH private key, for `ssh_key` credentials.
    pub private_key_enc: Option<String>,
    pub public_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A named agent flavor: image key, resource limits, extra environment.
/// Read-only to the execution engine.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DevEnvironment {
    pub id: i64,
    pub name: String,
    /// Agent type key, e.g. `claude_code`, `opencode`, `gemini_cli`.
    pub env_type: String,
    /// CPU limit in decimal cores.
    pub cpu_limit: Option<f64>,
    /// Memory limit in MiB.
    pub memory_limit: Option<i64>,
    pub env_vars: sqlx::types::Json<std::collections::HashMap<String, String>>,
    pub created_at: DateTime<Utc>,
}

/// A unit of work bound to a repo, branch, and environment; has 1..N
/// conversations. `workspace_path` is owned by the executor.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub project_id: Option<i64>,
    pub dev_environment_id: Option<i64>,
    pub start_branch: String,
    pub work_branch: Option<String>,
    pub workspace_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One prompt executed against a task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub task_id: Option<i64>,
    /// The prompt text handed to the agent.
    pub content: String,
    pub status: ConversationStatus,
    /// Set only when `status = success`.
    pub commit_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only log blob plus metadata, 1:1 with a conversation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub conversation_id: i64,
    pub logs: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// The masked (audit) form of the agent container command.
    pub docker_command: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Structured JSON the agent emits at the end of a conversation.
/// At most one per conversation; never updated once created.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ConversationResult {
    pub id: i64,
    pub conversation_id: i64,
    pub result_type: String,
    pub subtype: String,
    pub is_error: bool,
    pub session_id: String,
    /// The full parsed result object, free-form fields included.
    pub payload: sqlx::types::Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A pending conversation with its execution context eagerly loaded.
///
/// The detail fields are `Option` because the referenced rows may be absent;
/// the executor validates them in order before launching anything.
#[derive(Debug, Clone)]
pub struct PendingConversation {
    pub conversation: Conversation,
    pub task: Option<Task>,
    pub project: Option<Project>,
    pub environment: Option<DevEnvironment>,
    pub credential: Option<GitCredential>,
}
