//! Media Cache Core - content-addressable local cache for remote media.
//!
//! Given a reference to a remote object, the cache returns a path to a local
//! copy. It downloads each object at most once even under concurrent requests,
//! stores identical bytes reached through different references only once, and
//! keeps total disk usage under a byte budget by evicting least recently used
//! content.
//!
//! # Example
//!
//! ```rust,ignore
//! use media_cache_core::{CancellationToken, MediaCache};
//!
//! #[tokio::main]
//! async fn main() -> media_cache_core::Result<()> {
//!     let cache = MediaCache::builder("/var/cache/media")
//!         .remote_base_url("https://media.example.com/objects")
//!         .budget_bytes(256 * 1024 * 1024)
//!         .build()
//!         .await?;
//!
//!     let path = cache
//!         .get_or_download("token", "albums/42/cover.jpg", None, true, &CancellationToken::new())
//!         .await?;
//!     println!("thumbnail at {:?}", path);
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod clock;
pub mod config;
pub mod download;
pub mod error;
pub mod eviction;
pub mod hashing;
pub mod key;
pub mod lease;
pub mod metadata;
pub mod network;
pub mod registrar;
pub mod stats;
pub mod store;

mod api;
mod context;

pub use api::{MediaCacheBuilder, ReconcileReport, RegisteredFile};
pub use cancel::{CancellationToken, CancelledError};
pub use config::{CacheConfig, StoreBackend};
pub use error::{MediaCacheError, Result};
pub use eviction::SweepReport;
pub use key::{CacheKey, EntryKind, Variant};
pub use lease::CacheLease;
pub use network::{HttpTransport, RemoteTransport, TransferRequest};
pub use stats::CacheStats;
pub use store::{CacheEntry, MetadataStore};

use context::CacheContext;
use download::DownloadCoordinator;
use registrar::HashingRegistrar;
use std::sync::Arc;

/// Handle to one cache root.
///
/// Built with [`MediaCache::builder`] and shared by reference or inside an
/// `Arc`; there is no global instance. Lookups, downloads and registrations
/// return `Ok(None)` on ordinary failures (network errors, missing files,
/// corrupt metadata). Only contract violations such as an empty reference are
/// reported as errors.
pub struct MediaCache {
    ctx: Arc<CacheContext>,
    registrar: Arc<HashingRegistrar>,
    downloads: DownloadCoordinator,
}

impl MediaCache {
    /// Start configuring a cache rooted at `root`.
    pub fn builder(root: impl Into<std::path::PathBuf>) -> MediaCacheBuilder {
        MediaCacheBuilder::new(root)
    }

    /// Active configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.ctx.config
    }
}

impl Drop for MediaCache {
    fn drop(&mut self) {
        // Transfers hold their own handles; stop them with the cache.
        self.downloads.shutdown();
    }
}
