//! Engine configuration. The daemon resolves these values from its config
//! file / environment / flags; everything here carries a working default.

use std::path::PathBuf;
use std::time::Duration;

/// Proxy settings injected into git subprocess environments when enabled.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub http: Option<String>,
    pub https: Option<String>,
    pub no_proxy: Option<String>,
}

/// Maps a dev-environment type key to a container image.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnvTypeImage {
    pub key: String,
    pub image: String,
}

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for per-task workspaces.
    pub workspace_base_dir: PathBuf,
    /// Global concurrency cap for running conversations.
    pub max_concurrent_tasks: usize,
    /// Scheduler tick period.
    pub scheduler_interval: Duration,
    /// Per-clone budget.
    pub git_clone_timeout: Duration,
    /// Per-agent-run budget.
    pub docker_execution_timeout: Duration,
    /// When false, `GIT_SSL_NO_VERIFY=true` is injected.
    pub git_ssl_verify: bool,
    pub git_proxy: ProxyConfig,
    /// Dev-environment type → image table. Unknown types fall back to
    /// [`crate::container::FALLBACK_IMAGE`].
    pub dev_environment_types: Vec<EnvTypeImage>,
    /// Key material for credential secret decryption.
    pub aes_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_base_dir: PathBuf::from("/tmp/xsha-workspaces"),
            max_concurrent_tasks: 5,
            scheduler_interval: Duration::from_secs(5),
            git_clone_timeout: Duration::from_secs(300),
            docker_execution_timeout: Duration::from_secs(120 * 60),
            git_ssl_verify: false,
            git_proxy: ProxyConfig::default(),
            dev_environment_types: Vec::new(),
            aes_key: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.workspace_base_dir, PathBuf::from("/tmp/xsha-workspaces"));
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.scheduler_interval, Duration::from_secs(5));
        assert_eq!(config.git_clone_timeout, Duration::from_secs(300));
        assert_eq!(config.docker_execution_timeout, Duration::from_secs(7200));
        assert!(!config.git_ssl_verify);
        assert!(!config.git_proxy.enabled);
    }
}
