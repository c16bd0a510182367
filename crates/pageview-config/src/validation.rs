// Configuration validation
//
// Validates that required fields are present and values are sensible

use crate::{QueueConfig, RuntimeConfig, ServerConfig, StorageBackend, StorageConfig};
use anyhow::{bail, Result};
use tracing::warn;

/// Longest accepted queue name.
const MAX_QUEUE_NAME_LEN: usize = 128;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_queue_config(&config.queue)?;
    validate_storage_config(&config.storage)?;

    if let Some(ref server) = config.server {
        validate_server_config(server)?;
    }

    Ok(())
}

/// Queue names double as storage path segments and Durable Object names.
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("queue name must not be empty");
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        bail!(
            "queue name must be at most {} characters, got {}",
            MAX_QUEUE_NAME_LEN,
            name.len()
        );
    }
    if name == "." || name == ".." {
        bail!("queue name must not be '.' or '..'");
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        bail!(
            "queue name '{}' contains invalid character '{}'; allowed: A-Z a-z 0-9 . _ -",
            name,
            bad
        );
    }
    Ok(())
}

fn validate_queue_config(config: &QueueConfig) -> Result<()> {
    validate_queue_name(&config.name)?;

    if config.window_ms == 0 {
        bail!("queue.window_ms must be greater than 0");
    }

    if config.window_ms > 24 * 60 * 60 * 1000 {
        warn!(
            window_ms = config.window_ms,
            "queue.window_ms is longer than a day; pageviews will sit unflushed for a long time"
        );
    }

    Ok(())
}

fn validate_storage_config(config: &StorageConfig) -> Result<()> {
    match config.backend {
        StorageBackend::Fs => {
            let fs = config
                .fs
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("fs storage backend requires 'fs' configuration"))?;

            if fs.path.is_empty() {
                bail!("storage.fs.path must not be empty");
            }
        }
        StorageBackend::Memory => {
            warn!("memory storage backend selected; pending pageviews will not survive a restart");
        }
    }

    Ok(())
}

fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.listen_addr.is_empty() {
        bail!("server.listen_addr must not be empty");
    }

    // Basic validation that it looks like an address
    if !config.listen_addr.contains(':') {
        bail!("server.listen_addr must be in format 'host:port'");
    }

    Ok(())
}
