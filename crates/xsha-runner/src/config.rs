//! Configuration file management for the runner daemon.
//!
//! TOML config at `~/.config/xsha/config.toml` with the resolution chain:
//! CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use xsha_core::config::{EngineConfig, EnvTypeImage, ProxyConfig};
use xsha_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub engine: EngineSection,
    /// Dev-environment type → image table.
    #[serde(default)]
    pub environments: Vec<EnvTypeImage>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SecuritySection {
    /// Hex-encoded key material for credential secret encryption.
    pub aes_key: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineSection {
    pub workspace_base_dir: Option<PathBuf>,
    pub max_concurrent_tasks: Option<usize>,
    pub scheduler_interval_secs: Option<u64>,
    pub git_clone_timeout_secs: Option<u64>,
    pub docker_execution_timeout_secs: Option<u64>,
    pub git_ssl_verify: Option<bool>,
    #[serde(default)]
    pub proxy: ProxySection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProxySection {
    #[serde(default)]
    pub enabled: bool,
    pub http: Option<String>,
    pub https: Option<String>,
    pub no_proxy: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the xsha config directory: `$XDG_CONFIG_HOME/xsha` or
/// `~/.config/xsha`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("xsha");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("xsha")
}

/// Return the path to the config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file. Returns an error if it does not exist.
pub fn load_config(path: &std::path::Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix (it holds the encryption key).
pub fn save_config(path: &std::path::Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Generate a random encryption key: 32 random bytes, hex-encoded.
pub fn generate_aes_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// CLI-level overrides that take precedence over everything else.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub database_url: Option<String>,
    pub workspace_dir: Option<PathBuf>,
    pub max_concurrent: Option<usize>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct RunnerConfig {
    pub db_config: DbConfig,
    pub engine: EngineConfig,
}

impl RunnerConfig {
    /// Resolve configuration using the chain:
    /// CLI flag > env var > config file > default.
    ///
    /// - DB URL: flag > `XSHA_DATABASE_URL` > `[database].url` > default path
    /// - AES key: `XSHA_AES_KEY` > `[security].aes_key` > error
    pub fn resolve(config_file: Option<&std::path::Path>, cli: &CliOverrides) -> Result<Self> {
        let file = match config_file {
            Some(path) => Some(load_config(path)?),
            None => load_config(&config_path()).ok(),
        };
        let file = file.unwrap_or_default();

        let database_url = if let Some(url) = &cli.database_url {
            url.clone()
        } else if let Ok(url) = std::env::var("XSHA_DATABASE_URL") {
            url
        } else if let Some(url) = &file.database.url {
            url.clone()
        } else {
            DbConfig::default_url()
        };

        let aes_key = if let Ok(key) = std::env::var("XSHA_AES_KEY") {
            key
        } else if let Some(key) = &file.security.aes_key {
            key.clone()
        } else {
            bail!(
                "encryption key not found; set XSHA_AES_KEY or run `xsha-runner init` \
                 to create a config file"
            );
        };

        let defaults = EngineConfig::default();
        let section = &file.engine;
        let engine = EngineConfig {
            workspace_base_dir: cli
                .workspace_dir
                .clone()
                .or_else(|| section.workspace_base_dir.clone())
                .unwrap_or(defaults.workspace_base_dir),
            max_concurrent_tasks: cli
                .max_concurrent
                .or(section.max_concurrent_tasks)
                .unwrap_or(defaults.max_concurrent_tasks),
            scheduler_interval: section
                .scheduler_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.scheduler_interval),
            git_clone_timeout: section
                .git_clone_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.git_clone_timeout),
            docker_execution_timeout: section
                .docker_execution_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.docker_execution_timeout),
            git_ssl_verify: section.git_ssl_verify.unwrap_or(defaults.git_ssl_verify),
            git_proxy: ProxyConfig {
                enabled: section.proxy.enabled,
                http: section.proxy.http.clone(),
                https: section.proxy.https.clone(),
                no_proxy: section.proxy.no_proxy.clone(),
            },
            dev_environment_types: file.environments.clone(),
            aes_key,
        };

        Ok(Self {
            db_config: DbConfig::new(database_url),
            engine,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
