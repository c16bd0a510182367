use anyhow::{Context, Result};
use clap::Parser;
use pageview_config::{RuntimeConfig, ServerConfig, StorageBackend};
use std::path::PathBuf;

/// Debounced pageview batching server
#[derive(Parser)]
#[command(name = "pageview-batcher")]
#[command(version)]
#[command(about = "Collects pageviews and flushes them in debounced batches", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// HTTP listen port (overrides config file)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Directory for durable queue state (filesystem backend only)
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load_or_default().context("Failed to load configuration")?
    };

    // CLI flags win over files and environment
    apply_cli_overrides(&mut config, &cli)?;
    config.validate().context("Invalid configuration")?;

    prepare_data_dir(&config)?;

    pageview_server::run(config).await
}

fn apply_cli_overrides(config: &mut RuntimeConfig, cli: &Cli) -> Result<()> {
    if let Some(port) = cli.port {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.listen_addr = format!("0.0.0.0:{}", port);
    }

    if let Some(dir) = &cli.data_dir {
        if config.storage.backend != StorageBackend::Fs {
            anyhow::bail!(
                "--data-dir only works with the filesystem backend, but backend is '{}'.\n\
                Either remove --data-dir or set storage.backend to 'fs'.",
                config.storage.backend
            );
        }

        let fs_config = config.storage.fs.get_or_insert_with(Default::default);
        fs_config.path = dir.to_string_lossy().to_string();
    }

    if let Some(level) = &cli.log_level {
        let server = config.server.get_or_insert_with(ServerConfig::default);
        server.log_level = level.clone();
    }

    Ok(())
}

/// Create the state directory up front and make sure it is writable, so a bad
/// path fails at startup rather than on the first pageview.
fn prepare_data_dir(config: &RuntimeConfig) -> Result<()> {
    if config.storage.backend != StorageBackend::Fs {
        return Ok(());
    }

    let fs_config = config
        .storage
        .fs
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("filesystem backend requires storage.fs configuration"))?;
    let data_dir = PathBuf::from(&fs_config.path);

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory: {}", fs_config.path))?;

    let write_test = data_dir.join(".pageview-write-test");
    std::fs::write(&write_test, b"test").with_context(|| {
        format!(
            "Data directory '{}' is not writable. Check permissions.",
            fs_config.path
        )
    })?;
    std::fs::remove_file(&write_test).context("Failed to remove write test file")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_port_and_level() {
        let cli = Cli::parse_from(["pageview-batcher", "--port", "9000", "-v", "debug"]);
        let mut config = RuntimeConfig::server_defaults();
        apply_cli_overrides(&mut config, &cli).unwrap();

        let server = config.server.unwrap();
        assert_eq!(server.listen_addr, "0.0.0.0:9000");
        assert_eq!(server.log_level, "debug");
    }

    #[test]
    fn test_data_dir_requires_fs_backend() {
        let cli = Cli::parse_from(["pageview-batcher", "--data-dir", "/tmp/q"]);
        let mut config = RuntimeConfig::server_defaults();
        config.storage.backend = StorageBackend::Memory;
        assert!(apply_cli_overrides(&mut config, &cli).is_err());
    }

    #[test]
    fn test_prepare_data_dir_creates_directory() {
        let root = tempfile::tempdir().unwrap();
        let data = root.path().join("state");

        let mut config = RuntimeConfig::server_defaults();
        config.storage.fs.get_or_insert_with(Default::default).path =
            data.to_string_lossy().to_string();

        prepare_data_dir(&config).unwrap();
        assert!(data.is_dir());
        assert!(!data.join(".pageview-write-test").exists());
    }
}
