//! Media Cache RPC Server - JSON-RPC backend for a UI process.
//!
//! This binary opens one media cache and serves its public API as JSON-RPC 2.0
//! over HTTP on the loopback interface.

mod handlers;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use media_cache_core::{CacheConfig, MediaCacheBuilder, StoreBackend};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Sqlite,
    Json,
}

impl From<BackendArg> for StoreBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Sqlite => StoreBackend::Sqlite,
            BackendArg::Json => StoreBackend::Json,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "media-cache-rpc")]
#[command(about = "JSON-RPC server for the media cache")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "compact")]
    log_format: LogFormat,

    /// Cache root directory (defaults to the platform cache directory)
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Byte budget for stored content
    #[arg(long)]
    budget_bytes: Option<u64>,

    /// Number of downloads allowed to run at once
    #[arg(long)]
    download_concurrency: Option<usize>,

    /// Base URL of the remote object store
    #[arg(long)]
    base_url: Option<String>,

    /// Metadata backend
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
}

fn init_logging(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    match args.log_format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("media-cache")
}

/// File values first, then flags.
fn resolve_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::load(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?
            .with_context(|| format!("Config file not found: {}", path.display()))?,
        None => CacheConfig::new(default_cache_root()),
    };

    if let Some(root) = &args.cache_root {
        config.root = root.clone();
    }
    if let Some(budget) = args.budget_bytes {
        config.budget_bytes = budget;
    }
    if let Some(concurrency) = args.download_concurrency {
        config.download_concurrency = concurrency;
    }
    if let Some(url) = &args.base_url {
        config.remote_base_url = Some(url.clone());
    }
    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting Media Cache RPC Server");

    let config = resolve_config(&args)?;
    info!("Cache root: {}", config.root.display());

    let cache = MediaCacheBuilder::from_config(config).build().await?;

    let addr = server::start_server(cache, &args.host, args.port).await?;

    // Print port for the UI process to read (intentional stdout for IPC)
    println!("RPC_PORT={}", addr.port());

    info!("RPC server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "media-cache-rpc",
            "--cache-root",
            "/tmp/mc",
            "--budget-bytes",
            "1024",
            "--backend",
            "json",
        ]);
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.root, PathBuf::from("/tmp/mc"));
        assert_eq!(config.budget_bytes, 1024);
        assert_eq!(config.backend, StoreBackend::Json);
        assert_eq!(config.download_concurrency, 2);
    }

    #[test]
    fn test_flags_override_config_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");
        std::fs::write(
            &path,
            r#"{"root": "/srv/cache", "budget_bytes": 10, "download_concurrency": 8}"#,
        )
        .unwrap();

        let args = Args::parse_from([
            "media-cache-rpc",
            "--config",
            path.to_str().unwrap(),
            "--budget-bytes",
            "99",
        ]);
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/cache"));
        assert_eq!(config.budget_bytes, 99);
        assert_eq!(config.download_concurrency, 8);
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let args = Args::parse_from(["media-cache-rpc", "--config", "/nonexistent/cache.json"]);
        assert!(resolve_config(&args).is_err());
    }
}
