// pageview-config - Unified configuration for the server and Workers runtimes
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path from PAGEVIEW_CONFIG env var
// 3. Config file contents from PAGEVIEW_CONFIG_CONTENT env var
// 4. Default config file locations (./config.toml, ./.pageview.toml)
// 5. Built-in defaults (lowest priority)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod env_overrides;
#[cfg(not(target_arch = "wasm32"))]
mod sources;
mod validation;

pub use env_overrides::{apply_env_overrides, EnvSource, ENV_PREFIX};
pub use validation::validate_queue_name;

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
}

/// Debounced queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Name of the queue every tracked pageview is routed to
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Quiescence window between the first pending pageview and the flush
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_queue_name() -> String {
    "default".to_string()
}

fn default_window_ms() -> u64 {
    10_000
}

impl QueueConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            window_ms: default_window_ms(),
        }
    }
}

/// Durable storage configuration (native server only; Workers use DO storage)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            fs: Some(FsConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StorageBackend::Fs),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            _ => anyhow::bail!("Unsupported storage backend: {}. Supported: fs, memory", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub path: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            path: "./data".to_string(),
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8787".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl RuntimeConfig {
    /// Defaults for the native server: filesystem storage and a server section
    pub fn server_defaults() -> Self {
        Self {
            server: Some(ServerConfig::default()),
            ..Self::default()
        }
    }

    /// Load configuration from all sources with priority
    #[cfg(not(target_arch = "wasm32"))]
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load configuration starting from an explicit file (CLI --config flag)
    #[cfg(not(target_arch = "wasm32"))]
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        sources::load_from_file_path(path)
    }

    /// Load configuration, falling back to defaults when no file is present
    #[cfg(not(target_arch = "wasm32"))]
    pub fn load_or_default() -> Result<Self> {
        sources::load_or_default()
    }

    /// Parse inline TOML, then apply overrides from `env`.
    /// Used by runtimes without filesystem access.
    pub fn from_toml_with_env<E: EnvSource>(inline: Option<&str>, env: &E) -> Result<Self> {
        let mut config = Self::default();
        if let Some(content) = inline {
            let file_config: RuntimeConfig = toml::from_str(content)?;
            config.merge(file_config);
        }
        apply_env_overrides(&mut config, env)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace sections with those from `other` (file config over defaults)
    pub fn merge(&mut self, other: RuntimeConfig) {
        self.queue = other.queue;
        self.storage = other.storage;
        if other.server.is_some() {
            self.server = other.server;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}
