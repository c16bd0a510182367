use crate::{FsConfig, LogFormat, RuntimeConfig, ServerConfig, StorageBackend};
use anyhow::{anyhow, Context, Result};

pub const ENV_PREFIX: &str = "PAGEVIEW_";

/// Abstraction over environment-variable lookups so runtimes without `std::env`
/// can supply their own source of overrides.
pub trait EnvSource {
    /// Get a variable by its unprefixed name (`QUEUE_NAME` reads `PAGEVIEW_QUEUE_NAME`)
    fn get(&self, key: &str) -> Option<String>;
}

/// Apply environment-variable overrides (highest priority) to the runtime config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    // Queue configuration
    if let Some(name) = env.get("QUEUE_NAME") {
        config.queue.name = name;
    }
    if let Some(val) = get_env_u64(env, "QUEUE_WINDOW_MS")? {
        config.queue.window_ms = val;
    }

    // Server configuration (listen addr, log level/format)
    if let Some(addr) = env.get("LISTEN_ADDR") {
        ensure_server(config).listen_addr = addr;
    }
    if let Some(level) = env.get("LOG_LEVEL") {
        ensure_server(config).log_level = level;
    }
    if let Some(format) = env.get("LOG_FORMAT") {
        let parsed = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
        ensure_server(config).log_format = parsed;
    }

    // Storage backend
    if let Some(backend) = env.get("STORAGE_BACKEND") {
        config.storage.backend = backend
            .parse::<StorageBackend>()
            .context("Invalid PAGEVIEW_STORAGE_BACKEND value")?;
    }
    if let Some(path) = env.get("STORAGE_PATH") {
        config.storage.fs.get_or_insert_with(FsConfig::default).path = path;
    }

    Ok(())
}

fn ensure_server(config: &mut RuntimeConfig) -> &mut ServerConfig {
    config.server.get_or_insert_with(ServerConfig::default)
}

fn get_env_u64<E: EnvSource>(env: &E, key: &str) -> Result<Option<u64>> {
    match env.get(key) {
        Some(val) => val
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| anyhow!("{}{} must be an unsigned integer: {}", ENV_PREFIX, key, e)),
        None => Ok(None),
    }
}
