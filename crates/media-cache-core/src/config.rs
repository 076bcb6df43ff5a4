//! Centralized configuration for the media cache.
//!
//! Fixed defaults live on unit structs as associated constants; everything a
//! deployment may want to change is carried by [`CacheConfig`].

use crate::error::{MediaCacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default values for the runtime configuration.
pub struct CacheDefaults;

impl CacheDefaults {
    pub const BUDGET_BYTES: u64 = 512 * 1024 * 1024; // 512 MiB
    pub const DOWNLOAD_CONCURRENCY: usize = 2;
    pub const EVICTION_BATCH_SIZE: usize = 100;
    pub const MAX_EVICTION_BATCHES: usize = 16;
    pub const REQUEST_TIMEOUT_SECS: u64 = 60;
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const USER_AGENT: &'static str = concat!("media-cache/", env!("CARGO_PKG_VERSION"));
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DOWNLOAD_TEMP_PREFIX: &'static str = "dl-";
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
}

/// On-disk layout under the cache root.
pub struct PathsConfig;

impl PathsConfig {
    pub const FILES_DIR_NAME: &'static str = "files";
    pub const STAGING_DIR_NAME: &'static str = "staging";
    pub const SQLITE_INDEX_FILENAME: &'static str = "index.sqlite";
    pub const JSON_INDEX_FILENAME: &'static str = "index.json";
    pub const MAX_EXTENSION_LEN: usize = 10;
}

/// Which metadata backend persists the content store and alias table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Json,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Sqlite => "sqlite",
            StoreBackend::Json => "json",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Some(StoreBackend::Sqlite),
            "json" => Some(StoreBackend::Json),
            _ => None,
        }
    }
}

/// Runtime configuration for a [`crate::MediaCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root directory.
    pub root: PathBuf,
    /// Total bytes the content store may hold before eviction kicks in.
    pub budget_bytes: u64,
    /// Number of transfers allowed to run at the same time.
    pub download_concurrency: usize,
    /// Oldest entries fetched per eviction batch.
    pub eviction_batch_size: usize,
    /// Upper bound on batches fetched by a single sweep.
    pub max_eviction_batches: usize,
    /// Metadata backend.
    pub backend: StoreBackend,
    /// Base URL of the remote object store.
    pub remote_base_url: Option<String>,
    /// Timeout for a single remote request.
    pub request_timeout_secs: u64,
    /// Re-hash files on every hit instead of checking the size only.
    pub verify_on_hit: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./media-cache"),
            budget_bytes: CacheDefaults::BUDGET_BYTES,
            download_concurrency: CacheDefaults::DOWNLOAD_CONCURRENCY,
            eviction_batch_size: CacheDefaults::EVICTION_BATCH_SIZE,
            max_eviction_batches: CacheDefaults::MAX_EVICTION_BATCHES,
            backend: StoreBackend::default(),
            remote_base_url: None,
            request_timeout_secs: CacheDefaults::REQUEST_TIMEOUT_SECS,
            verify_on_hit: false,
        }
    }
}

impl CacheConfig {
    /// Default configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(MediaCacheError::invalid_argument("root", "must not be empty"));
        }
        if self.budget_bytes == 0 {
            return Err(MediaCacheError::invalid_argument(
                "budget_bytes",
                "must be greater than zero",
            ));
        }
        if self.download_concurrency == 0 {
            return Err(MediaCacheError::invalid_argument(
                "download_concurrency",
                "must be at least 1",
            ));
        }
        if self.eviction_batch_size == 0 || self.max_eviction_batches == 0 {
            return Err(MediaCacheError::invalid_argument(
                "eviction_batch_size",
                "batch size and batch cap must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join(PathsConfig::FILES_DIR_NAME)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(PathsConfig::STAGING_DIR_NAME)
    }

    pub fn index_path(&self) -> PathBuf {
        match self.backend {
            StoreBackend::Sqlite => self.root.join(PathsConfig::SQLITE_INDEX_FILENAME),
            StoreBackend::Json => self.root.join(PathsConfig::JSON_INDEX_FILENAME),
        }
    }

    /// Load a configuration file written as JSON. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        crate::metadata::atomic_read_json(path)
    }
}
