//! Admin tool configuration.
//!
//! Stored as JSON under the platform config directory
//! (`~/.config/planet-admin/config.json` on Linux). Environment variables
//! override the file:
//! - `PLANET_ADMIN_URL` - manager base URL (default: `http://localhost:7531/api/v1`)
//! - `PLANET_ADMIN_API_KEY` - API key for authentication (optional)
//! - `PLANET_ADMIN_TIMEOUT_SECS` - per-component bound on start/stop waits

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// Default URL for a manager on this machine.
pub const DEFAULT_URL: &str = "http://localhost:7531/api/v1";

const APP_NAME: &str = "planet-admin";
const CONFIG_FILE: &str = "config.json";
const MAX_RECENT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentConnection {
    pub url: String,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub manager_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// `None` waits for moods indefinitely.
    pub wait_timeout_secs: Option<u64>,
    /// Most recent first.
    pub recent_connections: Vec<RecentConnection>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            manager_url: DEFAULT_URL.to_string(),
            api_key: None,
            wait_timeout_secs: None,
            recent_connections: Vec::new(),
        }
    }
}

impl AdminConfig {
    pub fn default_path() -> Result<PathBuf> {
        let mut path =
            config_dir().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push(APP_NAME);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(Self::default_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// A missing file gives the defaults; a malformed one is logged and ignored.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        match serde_json::from_str(&raw) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring malformed config: {}", e);
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Self::default_path()?)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Apply `PLANET_ADMIN_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("PLANET_ADMIN_URL") {
            self.manager_url = url;
        }
        if let Some(key) = lookup("PLANET_ADMIN_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(secs) = lookup("PLANET_ADMIN_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => self.wait_timeout_secs = Some(secs),
                Err(_) => tracing::warn!(value = %secs, "PLANET_ADMIN_TIMEOUT_SECS is not a number"),
            }
        }
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }

    /// Move `url` to the front of the recent list, keeping at most ten entries.
    pub fn remember_connection(&mut self, url: &str, at: DateTime<Utc>) {
        self.recent_connections.retain(|c| c.url != url);
        self.recent_connections.insert(
            0,
            RecentConnection {
                url: url.to_string(),
                last_used: at,
            },
        );
        self.recent_connections.truncate(MAX_RECENT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AdminConfig::load_from(dir.path().join("config.json")).unwrap();
        assert_eq!(config, AdminConfig::default());
    }

    #[test]
    fn malformed_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(AdminConfig::load_from(&path).unwrap(), AdminConfig::default());
    }

    #[test]
    fn saves_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = AdminConfig {
            manager_url: "http://manager:7531/api/v1".into(),
            wait_timeout_secs: Some(30),
            ..Default::default()
        };
        config.remember_connection("http://manager:7531/api/v1", Utc::now());
        config.save_to(&path).unwrap();

        assert_eq!(AdminConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = AdminConfig::default();
        config.apply_env(|key| match key {
            "PLANET_ADMIN_URL" => Some("http://other/api/v1".into()),
            "PLANET_ADMIN_TIMEOUT_SECS" => Some("12".into()),
            _ => None,
        });
        assert_eq!(config.manager_url, "http://other/api/v1");
        assert_eq!(config.wait_timeout(), Some(Duration::from_secs(12)));
        assert!(config.api_key.is_none());
    }

    #[test]
    fn recent_connections_are_deduplicated_and_capped() {
        let mut config = AdminConfig::default();
        for i in 0..12 {
            config.remember_connection(&format!("http://m{}", i), Utc::now());
        }
        config.remember_connection("http://m5", Utc::now());

        assert_eq!(config.recent_connections.len(), 10);
        assert_eq!(config.recent_connections[0].url, "http://m5");
        assert_eq!(
            config
                .recent_connections
                .iter()
                .filter(|c| c.url == "http://m5")
                .count(),
            1
        );
    }
}
