// Initialization utilities for server mode
//
// Storage operator and logging/tracing setup

use anyhow::{Context, Result};
use opendal::Operator;
use pageview_config::{LogFormat, RuntimeConfig, ServerConfig, StorageBackend};
use tracing::info;

/// Build the OpenDAL operator that backs queue state.
pub fn init_operator(config: &RuntimeConfig) -> Result<Operator> {
    info!(
        "Initializing queue storage with backend: {}",
        config.storage.backend
    );

    let operator = match config.storage.backend {
        StorageBackend::Fs => {
            let fs = config
                .storage
                .fs
                .as_ref()
                .context("fs config required for filesystem backend")?;
            info!("Using filesystem storage at: {}", fs.path);

            let fs_builder = opendal::services::Fs::default().root(&fs.path);
            Operator::new(fs_builder)?.finish()
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage; queue state will not survive a restart");
            Operator::new(opendal::services::Memory::default())?.finish()
        }
    };

    Ok(operator)
}

/// Initialize tracing/logging from RuntimeConfig
pub fn init_tracing(config: &RuntimeConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let defaults = ServerConfig::default();
    let server = config.server.as_ref().unwrap_or(&defaults);

    let env_filter =
        EnvFilter::try_new(&server.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    // try_init: a global subscriber may already be installed by an embedding binary
    let installed = match server.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageview_config::FsConfig;

    #[tokio::test]
    async fn test_memory_operator_round_trip() {
        let mut config = RuntimeConfig::server_defaults();
        config.storage.backend = StorageBackend::Memory;

        let op = init_operator(&config).unwrap();
        op.write("smoke.txt", "ok").await.unwrap();
        assert_eq!(op.read("smoke.txt").await.unwrap().to_vec(), b"ok");
    }

    #[tokio::test]
    async fn test_fs_operator_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::server_defaults();
        config.storage.fs = Some(FsConfig {
            path: dir.path().to_string_lossy().into_owned(),
        });

        let op = init_operator(&config).unwrap();
        op.write("queues/default/alarm.json", "{}").await.unwrap();
        assert!(dir.path().join("queues/default/alarm.json").exists());
    }

    #[test]
    fn test_fs_backend_without_path_is_an_error() {
        let mut config = RuntimeConfig::server_defaults();
        config.storage.fs = None;
        assert!(init_operator(&config).is_err());
    }
}
