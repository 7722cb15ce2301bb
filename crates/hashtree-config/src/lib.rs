//! Shared configuration for hashtree tools
//!
//! Reads from ~/.hashtree/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default delay before a dirty root is published
pub const DEFAULT_PUBLISH_DEBOUNCE_MS: u64 = 1000;

/// Default delay before a failed publish is retried
pub const DEFAULT_PUBLISH_RETRY_MS: u64 = 5000;

/// Default chunk size for stored files (2 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub tree: TreeConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    get_hashtree_dir()
        .join("data")
        .to_string_lossy()
        .to_string()
}

/// Tree root registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_publish_debounce_ms")]
    pub publish_debounce_ms: u64,
    #[serde(default = "default_publish_retry_ms")]
    pub publish_retry_ms: u64,
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    /// Root record file; relative paths are under the data dir
    #[serde(default = "default_roots_file")]
    pub roots_file: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            publish_debounce_ms: default_publish_debounce_ms(),
            publish_retry_ms: default_publish_retry_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            roots_file: default_roots_file(),
        }
    }
}

fn default_publish_debounce_ms() -> u64 {
    DEFAULT_PUBLISH_DEBOUNCE_MS
}

fn default_publish_retry_ms() -> u64 {
    DEFAULT_PUBLISH_RETRY_MS
}

fn default_resolve_timeout_ms() -> u64 {
    10000
}

fn default_roots_file() -> String {
    "tree-roots.json".to_string()
}

impl RegistryConfig {
    /// Debounce delay, `HTREE_PUBLISH_DEBOUNCE_MS` overrides the file
    pub fn publish_debounce(&self) -> Duration {
        env_millis("HTREE_PUBLISH_DEBOUNCE_MS").unwrap_or(Duration::from_millis(
            self.publish_debounce_ms,
        ))
    }

    /// Retry delay, `HTREE_PUBLISH_RETRY_MS` overrides the file
    pub fn publish_retry(&self) -> Duration {
        env_millis("HTREE_PUBLISH_RETRY_MS")
            .unwrap_or(Duration::from_millis(self.publish_retry_ms))
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Absolute path of the root record file
    pub fn roots_path(&self, data_dir: &Path) -> PathBuf {
        let path = PathBuf::from(&self.roots_file);
        if path.is_absolute() {
            path
        } else {
            data_dir.join(path)
        }
    }
}

/// Tree storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub encrypted: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            encrypted: true,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_fetch_timeout_ms() -> u64 {
    10000
}

fn default_true() -> bool {
    true
}

impl TreeConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            let content = fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Data directory, `HTREE_DATA_DIR` overrides the file
    pub fn data_dir(&self) -> PathBuf {
        std::env::var("HTREE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(&self.storage.data_dir))
    }

    /// Path of the persisted tree root records
    pub fn roots_path(&self) -> PathBuf {
        self.registry.roots_path(&self.data_dir())
    }
}

/// Get the hashtree directory (~/.hashtree)
pub fn get_hashtree_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HTREE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hashtree")
}

/// Get the config file path (~/.hashtree/config.toml)
pub fn get_config_path() -> PathBuf {
    get_hashtree_dir().join("config.toml")
}

fn env_millis(var: &str) -> Option<Duration> {
    let value = std::env::var(var).ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_millis)
}
