//! Configuration for quartermaster

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::TrackerError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quartermaster")
}

/// How the deadline scheduler treats entities that stay in the due window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReminderPolicy {
    /// Remind on every scan while the entity is in the window
    #[default]
    EveryTick,
    /// Remind once when due soon and once more when it becomes overdue
    OncePerStage,
}

/// A peer shard reachable over HTTP
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub shard_id: u32,
    /// Base URL, e.g. `http://shard-1:8095`
    pub url: String,
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the database and the written default config
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// SQLite file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Directory holding item_desc.json, crafting_recipe_desc.json and
    /// building_type_desc.json
    #[serde(default = "default_catalog_dir")]
    pub catalog_dir: PathBuf,

    /// Id of this shard process
    #[serde(default)]
    pub shard_id: u32,

    /// Other shard processes sharing the store
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// HTTP port for shard RPC and the command endpoint
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Per-shard timeout for scatter-gather calls
    #[serde(default = "default_shard_timeout_ms")]
    pub shard_timeout_ms: u64,

    /// Chat gateway base URL; messages are only logged when unset
    #[serde(default)]
    pub chat_gateway_url: Option<String>,

    /// Timeout for a single outbound chat delivery
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Deadline scan interval in seconds
    #[serde(default = "default_reminder_interval")]
    pub reminder_interval_secs: u64,

    /// Half-width of the deadline window in hours
    #[serde(default = "default_reminder_window")]
    pub reminder_window_hours: i64,

    /// Rows fetched per page during a deadline scan
    #[serde(default = "default_reminder_page_size")]
    pub reminder_page_size: u32,

    #[serde(default)]
    pub reminder_policy: ReminderPolicy,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,
}

fn default_database_file() -> String {
    "tracker.db".to_string()
}

fn default_catalog_dir() -> PathBuf {
    PathBuf::from("data/region")
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8095
}

fn default_shard_timeout_ms() -> u64 {
    3000
}

fn default_delivery_timeout_ms() -> u64 {
    5000
}

fn default_reminder_interval() -> u64 {
    600
}

fn default_reminder_window() -> i64 {
    24
}

fn default_reminder_page_size() -> u32 {
    200
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            catalog_dir: default_catalog_dir(),
            shard_id: 0,
            peers: Vec::new(),
            bind_host: default_bind_host(),
            http_port: default_http_port(),
            shard_timeout_ms: default_shard_timeout_ms(),
            chat_gateway_url: None,
            delivery_timeout_ms: default_delivery_timeout_ms(),
            reminder_interval_secs: default_reminder_interval(),
            reminder_window_hours: default_reminder_window(),
            reminder_page_size: default_reminder_page_size(),
            reminder_policy: ReminderPolicy::default(),
            log_json: false,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TrackerError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| TrackerError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TrackerError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| TrackerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.reminder_interval_secs == 0 {
            return Err(TrackerError::Config("reminder_interval_secs must be > 0".into()));
        }
        if self.reminder_window_hours <= 0 {
            return Err(TrackerError::Config("reminder_window_hours must be > 0".into()));
        }
        if self.reminder_page_size == 0 {
            return Err(TrackerError::Config("reminder_page_size must be > 0".into()));
        }
        if let Some(peer) = self.peers.iter().find(|p| p.shard_id == self.shard_id) {
            return Err(TrackerError::Config(format!(
                "peer {} reuses this process's shard id",
                peer.url
            )));
        }
        Ok(())
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn shard_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_timeout_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn reminder_interval(&self) -> Duration {
        Duration::from_secs(self.reminder_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.reminder_interval(), Duration::from_secs(600));
        assert_eq!(config.reminder_window_hours, 24);
        assert_eq!(config.reminder_policy, ReminderPolicy::EveryTick);
        assert!(config.database_path().ends_with("tracker.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            shard_id = 2
            reminder_policy = "once_per_stage"

            [[peers]]
            shard_id = 0
            url = "http://shard-0:8095"
            "#,
        )
        .unwrap();

        assert_eq!(config.shard_id, 2);
        assert_eq!(config.reminder_policy, ReminderPolicy::OncePerStage);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.http_port, 8095);
        assert_eq!(config.shard_timeout(), Duration::from_millis(3000));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.shard_id = 3;
        config.chat_gateway_url = Some("http://gateway:9000".into());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.shard_id, 3);
        assert_eq!(loaded.chat_gateway_url.as_deref(), Some("http://gateway:9000"));
    }

    #[test]
    fn test_validate_rejects_own_shard_as_peer() {
        let mut config = Config::default();
        config.peers.push(PeerConfig {
            shard_id: 0,
            url: "http://localhost:8096".into(),
        });
        assert!(matches!(config.validate(), Err(TrackerError::Config(_))));
    }
}
