//! Layered configuration: built-in defaults, optional TOML file, environment
//! overrides (`AGENTSESSIOND_*`), then CLI flags win.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory for bare mirrors and worktrees.
    pub data_dir: PathBuf,
    /// Sqlite database path (relative paths are resolved under `data_dir`).
    pub database_path: PathBuf,
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// `tracing-subscriber` env-filter directive, e.g. "info" or "agentsessiond=debug".
    pub log_level: String,
    /// Shared HS256 secret used to verify bearer tokens.
    pub jwt_secret: String,
    /// Event types a user is subscribed to by default when no preference exists.
    pub notification_events_default: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_path: PathBuf::from("agentsessiond.db"),
            bind_addr: "127.0.0.1:8080".to_string(),
            log_level: "info".to_string(),
            jwt_secret: "dev-secret-change-me".to_string(),
            notification_events_default: vec![
                "session:completed".to_string(),
                "session:error".to_string(),
                "session:waiting_for_input".to_string(),
            ],
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional file path plus environment overrides.
    pub fn load(config_path: Option<&std::path::Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        } else {
            let default_path = dirs::config_dir()
                .map(|d| d.join("agentsessiond").join("config.toml"))
                .unwrap_or_else(|| PathBuf::from("agentsessiond.toml"));
            builder = builder.add_source(config::File::from(default_path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("AGENTSESSIOND")
                .separator("__")
                .try_parsing(true),
        );

        let settled = builder.build().context("building configuration")?;
        settled
            .try_deserialize()
            .context("deserializing configuration")
    }

    /// Resolved absolute path to the sqlite database file.
    pub fn resolved_database_path(&self) -> PathBuf {
        if self.database_path.is_absolute() {
            self.database_path.clone()
        } else {
            self.data_dir.join(&self.database_path)
        }
    }

    pub fn worktrees_root(&self) -> PathBuf {
        self.data_dir.join("worktrees")
    }

    pub fn repos_root(&self) -> PathBuf {
        self.data_dir.join("repos")
    }
}
