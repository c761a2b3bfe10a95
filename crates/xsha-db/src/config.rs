use std::path::PathBuf;

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite connection URL, e.g. `sqlite:///var/lib/xsha/xsha.db`.
    pub database_url: String,
}

impl DbConfig {
    /// In-memory database, used by tests.
    pub const MEMORY_URL: &'static str = "sqlite::memory:";

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Default on-disk location: `~/.local/share/xsha/xsha.db`
    /// (`$XDG_DATA_HOME/xsha/xsha.db` when set).
    pub fn default_url() -> String {
        let dir = if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(xdg).join("xsha")
        } else {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local")
                .join("share")
                .join("xsha")
        };
        format!("sqlite://{}", dir.join("xsha.db").display())
    }

    /// True when the URL points at an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:")
    }
}
