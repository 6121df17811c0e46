//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend URL, token lifetime, session storage backend and the last used
//! login identifier.
//!
//! Configuration is stored at `~/.config/civicdesk/config.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::{
    try_parse_duration, FileStore, KeyringStore, MemoryStore, SessionStore, DEFAULT_CHECK_INTERVAL_SECS,
    DEFAULT_TOKEN_LIFETIME,
};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "civicdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding `api_base_url`
pub const API_URL_ENV: &str = "CIVICDESK_API_URL";

const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api";

/// Where the session record is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    /// Lifetime passed to `set_token` at login, e.g. "1d", "12h"
    pub token_lifetime: String,
    pub storage: StorageKind,
    pub check_interval_secs: u64,
    pub last_identifier: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            token_lifetime: DEFAULT_TOKEN_LIFETIME.to_string(),
            storage: StorageKind::default(),
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            last_identifier: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                config.api_base_url = url.trim().to_string();
            }
        }
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        if try_parse_duration(&config.token_lifetime).is_none() {
            warn!(
                lifetime = %config.token_lifetime,
                "Unrecognized token lifetime, sessions will last 1d"
            );
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    /// Open the configured session store
    pub fn open_store(&self) -> Result<Arc<dyn SessionStore>> {
        Ok(match self.storage {
            StorageKind::File => {
                let dir = self.cache_dir()?;
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
                Arc::new(FileStore::new(&dir))
            }
            StorageKind::Keyring => Arc::new(KeyringStore::new()),
            StorageKind::Memory => Arc::new(MemoryStore::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.token_lifetime, "1d");
        assert_eq!(config.storage, StorageKind::File);
        assert_eq!(config.check_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"storage":"keyring","token_lifetime":"12h"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage, StorageKind::Keyring);
        assert_eq!(config.token_lifetime, "12h");
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            last_identifier: Some("asha@example.org".into()),
            check_interval_secs: 0,
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.last_identifier.as_deref(), Some("asha@example.org"));
        assert_eq!(reloaded.check_interval(), Duration::from_secs(1)); // clamped
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
