//! Builder for configuring MediaCache initialization.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::config::{CacheConfig, StoreBackend};
use crate::context::CacheContext;
use crate::download::DownloadCoordinator;
use crate::error::{MediaCacheError, Result};
use crate::network::{HttpTransport, RemoteTransport};
use crate::registrar::HashingRegistrar;
use crate::store::{self, MetadataStore};
use crate::MediaCache;

/// Builder for a [`MediaCache`].
///
/// # Example
///
/// ```rust,ignore
/// use media_cache_core::{MediaCache, StoreBackend};
///
/// let cache = MediaCache::builder("./media-cache")
///     .remote_base_url("https://media.example.com/objects")
///     .budget_bytes(64 * 1024 * 1024)
///     .download_concurrency(4)
///     .backend(StoreBackend::Json)
///     .build()
///     .await?;
/// ```
pub struct MediaCacheBuilder {
    config: CacheConfig,
    transport: Option<Arc<dyn RemoteTransport>>,
    store: Option<Arc<dyn MetadataStore>>,
}

impl MediaCacheBuilder {
    /// Default configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_config(CacheConfig::new(root))
    }

    /// Start from a complete configuration.
    pub fn from_config(config: CacheConfig) -> Self {
        Self {
            config,
            transport: None,
            store: None,
        }
    }

    /// Byte budget enforced by eviction.
    ///
    /// Default: 512 MiB
    pub fn budget_bytes(mut self, budget: u64) -> Self {
        self.config.budget_bytes = budget;
        self
    }

    /// Number of transfers that may run at once.
    ///
    /// Default: 2
    pub fn download_concurrency(mut self, permits: usize) -> Self {
        self.config.download_concurrency = permits;
        self
    }

    pub fn eviction_batch_size(mut self, batch: usize) -> Self {
        self.config.eviction_batch_size = batch;
        self
    }

    pub fn max_eviction_batches(mut self, batches: usize) -> Self {
        self.config.max_eviction_batches = batches;
        self
    }

    /// Metadata backend.
    ///
    /// Default: [`StoreBackend::Sqlite`]
    pub fn backend(mut self, backend: StoreBackend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Base URL for the built-in HTTP transport.
    pub fn remote_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.remote_base_url = Some(url.into());
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    /// Re-hash files on every hit.
    ///
    /// Default: `false` (size check only)
    pub fn verify_on_hit(mut self, enable: bool) -> Self {
        self.config.verify_on_hit = enable;
        self
    }

    /// Use `transport` instead of the built-in HTTP transport.
    pub fn transport(mut self, transport: Arc<dyn RemoteTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use an already opened metadata store instead of opening one under the
    /// root.
    pub fn store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn create_directory_structure(config: &CacheConfig) -> Result<()> {
        for dir in [config.root.clone(), config.files_dir(), config.staging_dir()] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir).map_err(|e| MediaCacheError::Io {
                    message: format!("Failed to create directory: {}", dir.display()),
                    path: Some(dir.clone()),
                    source: Some(e),
                })?;
            }
        }
        Ok(())
    }

    /// Open the cache.
    ///
    /// Resolves a relative root against the working directory, creates the
    /// directory layout, opens the metadata store, clears staging
    /// leftovers and reconciles metadata with the files on disk, then runs one
    /// eviction sweep in case the budget shrank.
    pub async fn build(self) -> Result<MediaCache> {
        let mut config = self.config;
        config.validate()?;
        // Entry paths are handed to other processes.
        config.root = std::path::absolute(&config.root)
            .map_err(|e| MediaCacheError::io_with_path(e, &config.root))?;
        Self::create_directory_structure(&config)?;

        let transport: Arc<dyn RemoteTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::from_config(&config)?),
        };

        let store = match self.store {
            Some(store) => store,
            None => {
                let store_config = config.clone();
                tokio::task::spawn_blocking(move || store::open_store(&store_config))
                    .await
                    .map_err(|e| {
                        MediaCacheError::Other(format!("Metadata store task failed: {}", e))
                    })??
            }
        };

        let ctx = Arc::new(CacheContext::new(config, store));
        let registrar = Arc::new(HashingRegistrar::new(Arc::clone(&ctx)));
        let downloads = DownloadCoordinator::new(
            Arc::clone(&ctx),
            Arc::clone(&registrar),
            transport,
            CancellationToken::new(),
        );

        let cache = MediaCache {
            ctx,
            registrar,
            downloads,
        };

        match cache.reconcile_with_staging(true).await {
            Ok(report) if report.has_changes() => info!(
                dropped = report.dropped_entries,
                orphans = report.orphan_files,
                staging = report.staging_files,
                aliases = report.dangling_aliases,
                "Reconciled cache with disk"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Startup reconciliation failed"),
        }
        cache.sweep().await;

        info!(
            root = %cache.config().root.display(),
            backend = cache.config().backend.as_str(),
            budget = cache.config().budget_bytes,
            concurrency = cache.config().download_concurrency,
            "Media cache ready"
        );
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_build_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("cache");

        let cache = MediaCacheBuilder::new(&root)
            .remote_base_url("http://127.0.0.1:9/objects")
            .build()
            .await
            .unwrap();

        assert!(root.join("files").is_dir());
        assert!(root.join("staging").is_dir());
        assert!(root.join("index.sqlite").exists());
        assert_eq!(cache.config().download_concurrency, 2);
    }

    #[tokio::test]
    async fn test_relative_root_is_made_absolute() {
        let cwd = std::env::current_dir().unwrap();
        let temp_dir = TempDir::new_in(&cwd).unwrap();
        let relative = temp_dir.path().strip_prefix(&cwd).unwrap().join("cache");
        assert!(relative.is_relative());

        let cache = MediaCacheBuilder::new(&relative)
            .remote_base_url("http://127.0.0.1:9/objects")
            .build()
            .await
            .unwrap();
        assert!(cache.config().root.is_absolute());
        assert_eq!(cache.config().root, cwd.join(&relative));

        let picked = temp_dir.path().join("photo.jpg");
        std::fs::write(&picked, b"photo").unwrap();
        let registered = cache
            .register_local_file(&picked, crate::EntryKind::UserLocal)
            .await
            .unwrap()
            .unwrap();
        assert!(registered.local_path.is_absolute());
        assert!(registered.local_path.starts_with(temp_dir.path()));
    }

    #[tokio::test]
    async fn test_build_with_json_backend() {
        let temp_dir = TempDir::new().unwrap();
        let cache = MediaCacheBuilder::new(temp_dir.path())
            .remote_base_url("http://127.0.0.1:9/")
            .backend(StoreBackend::Json)
            .build()
            .await
            .unwrap();

        assert_eq!(cache.config().backend, StoreBackend::Json);
        assert_eq!(cache.total_bytes().await, 0);
    }

    #[tokio::test]
    async fn test_build_requires_transport() {
        let temp_dir = TempDir::new().unwrap();
        let result = MediaCacheBuilder::new(temp_dir.path()).build().await;
        assert!(matches!(result, Err(MediaCacheError::Config { .. })));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let result = MediaCacheBuilder::new(temp_dir.path())
            .remote_base_url("http://127.0.0.1:9/")
            .download_concurrency(0)
            .build()
            .await;
        assert!(matches!(result, Err(MediaCacheError::InvalidArgument { .. })));
    }
}
