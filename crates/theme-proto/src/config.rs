use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

/// Where host UI bridges connect to deliver focus notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_host_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "platform::backend_address")]
    pub address: String,
    /// Upper bound on a `resolve_music_path` call.  The backend may transcode
    /// on first request, so this is generous.
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    /// Upper bound on every other backend call.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    /// Substring of the active location that marks the home screen.
    #[serde(default = "default_home_location")]
    pub home_location: String,
    /// Attribute carrying the game identifier on a tile element.
    #[serde(default = "default_tile_attribute")]
    pub tile_attribute: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_enabled_on_start")]
    pub enabled_on_start: bool,
    /// Used when a game's entry has no volume preference.
    #[serde(default = "default_volume")]
    pub default_volume: f32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_host_port(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: platform::backend_address(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            home_location: default_home_location(),
            tile_attribute: default_tile_attribute(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled_on_start: default_enabled_on_start(),
            default_volume: default_volume(),
        }
    }
}

fn default_pid_file() -> PathBuf {
    platform::data_dir().join("daemon.pid")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_host_port() -> u16 {
    platform::HOST_TCP_PORT
}

fn default_resolve_timeout_ms() -> u64 {
    15_000
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_store_path() -> PathBuf {
    platform::data_dir().join("identifier-cache.json")
}

fn default_home_location() -> String {
    "/library/home".to_string()
}

fn default_tile_attribute() -> String {
    "data-id".to_string()
}

fn default_enabled_on_start() -> bool {
    true
}

fn default_volume() -> f32 {
    1.0
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
