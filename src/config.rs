//! Configuration: TOML file with environment-variable overrides.
//!
//! Precedence, lowest to highest: built-in defaults → config file →
//! environment (`TASKBRIDGE_WEBHOOK_SECRET`, `TASKBRIDGE_PORT`,
//! `TASKBRIDGE_DB`) → CLI flags (applied in `main`). A missing config file is
//! not an error; a missing webhook secret is, since every delivery must be
//! signature-checked.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub webhook: WebhookConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address for the HTTP listener.
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    /// Shared HMAC secret configured on the provider's webhook settings.
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite database file. Defaults to the platform data directory.
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `path` (or the default location) and apply
    /// environment overrides. A nonexistent file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };
        let mut config = match &path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", p.display()))?
            }
            _ => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply `TASKBRIDGE_*` overrides from a variable lookup. Split from
    /// [`Config::apply_env`] so tests can inject values without mutating
    /// process-global environment state.
    fn apply_env_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = var("TASKBRIDGE_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                self.webhook.secret = Some(secret);
            }
        }
        if let Some(port) = var("TASKBRIDGE_PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!("TASKBRIDGE_PORT is not a valid port: {port}"),
            }
        }
        if let Some(db) = var("TASKBRIDGE_DB") {
            if !db.is_empty() {
                self.database.path = Some(PathBuf::from(db));
            }
        }
    }

    /// The webhook secret, required before the server can start.
    pub fn webhook_secret(&self) -> Result<&str> {
        self.webhook
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .context(
                "webhook secret not configured — set [webhook] secret in the config file \
                 or the TASKBRIDGE_WEBHOOK_SECRET environment variable",
            )
    }

    pub fn database_path(&self) -> PathBuf {
        self.database.path.clone().unwrap_or_else(default_db_path)
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "taskbridge").map(|dirs| dirs.config_dir().join("config.toml"))
}

fn default_db_path() -> PathBuf {
    ProjectDirs::from("", "", "taskbridge")
        .map(|dirs| dirs.data_dir().join("taskbridge.db"))
        .unwrap_or_else(|| PathBuf::from("taskbridge.db"))
}
