//! Lookup, download and registration methods on MediaCache.

use crate::cancel::CancellationToken;
use crate::error::{MediaCacheError, Result};
use crate::key::{CacheKey, EntryKind, Variant};
use crate::lease::CacheLease;
use crate::registrar::{extension_of, Incoming};
use crate::store::CacheEntry;
use crate::MediaCache;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A local file folded into the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredFile {
    /// Key of the entry that owns the bytes. For duplicate content this is the
    /// key of the copy that was already stored.
    pub canonical_key: String,
    pub local_path: PathBuf,
}

impl MediaCache {
    // ========================================
    // Lookup & Download
    // ========================================

    /// Local path for `reference`, downloading it on a miss.
    ///
    /// Concurrent calls for the same reference and variant share one transfer.
    /// `cancel` ends this call's wait only; the transfer keeps running for any
    /// other waiter and is still cached when it completes.
    ///
    /// Returns `Ok(None)` when the download fails or is cancelled. An empty
    /// reference is an error.
    pub async fn get_or_download(
        &self,
        credential: &str,
        reference: &str,
        display_name: Option<&str>,
        thumbnail: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>> {
        let key = CacheKey::new(reference, Variant::from_thumbnail_flag(thumbnail))?;
        match self
            .downloads
            .get_or_download(&key, credential, display_name, cancel)
            .await
        {
            Ok(path) => Ok(Some(path)),
            Err(e) => Self::collapse(&key, e),
        }
    }

    /// Local path for `reference` if it is already cached. Never touches the
    /// network.
    pub async fn try_get_cached_path(
        &self,
        reference: &str,
        thumbnail: bool,
    ) -> Result<Option<PathBuf>> {
        let key = CacheKey::new(reference, Variant::from_thumbnail_flag(thumbnail))?;
        match self.ctx.lookup(&key.as_storage_key()).await {
            Ok(Some(entry)) => {
                self.ctx.counters.record_hit();
                Ok(Some(entry.path))
            }
            Ok(None) => {
                self.ctx.counters.record_miss();
                Ok(None)
            }
            Err(e) => Self::collapse(&key, e),
        }
    }

    // ========================================
    // Registration
    // ========================================

    /// Hash a user-selected file and fold it into the cache.
    ///
    /// The file is copied, never moved. If the same bytes are already stored
    /// in the same variant namespace, no second copy is made and the returned
    /// key and path are those of the existing entry.
    pub async fn register_local_file(
        &self,
        path: &Path,
        kind: EntryKind,
    ) -> Result<Option<RegisteredFile>> {
        if path.as_os_str().is_empty() {
            return Err(MediaCacheError::invalid_argument("path", "must not be empty"));
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                debug!(path = %path.display(), "Local file missing, not registering");
                return Ok(None);
            }
        }

        let key = CacheKey::local(kind.variant()).as_storage_key();
        let extension = extension_of(path);
        match self
            .registrar
            .register(
                &key,
                Incoming::External(path.to_path_buf()),
                kind,
                extension.as_deref(),
            )
            .await
        {
            Ok(registration) => {
                debug!(
                    key = %key,
                    canonical = %registration.canonical_key,
                    deduplicated = registration.deduplicated,
                    "Registered local file"
                );
                Ok(Some(RegisteredFile {
                    canonical_key: registration.canonical_key,
                    local_path: registration.path,
                }))
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    kind = e.kind(),
                    error = %e,
                    "Failed to register local file"
                );
                Ok(None)
            }
        }
    }

    // ========================================
    // Inspection
    // ========================================

    /// Every stored entry, least recently accessed first.
    pub async fn list_entries(&self) -> Vec<CacheEntry> {
        self.ctx.store.list_all().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to list cache entries");
            Vec::new()
        })
    }

    /// Bytes currently held by the content store.
    pub async fn total_bytes(&self) -> u64 {
        self.ctx.store.total_bytes().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read cache size");
            0
        })
    }

    /// Hold a cached file open against eviction and removal.
    ///
    /// Returns `Ok(None)` when the reference is not cached.
    pub async fn lease(&self, reference: &str, thumbnail: bool) -> Result<Option<CacheLease>> {
        let key = CacheKey::new(reference, Variant::from_thumbnail_flag(thumbnail))?;
        let entry = match self.ctx.lookup(&key.as_storage_key()).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(e) => return Self::collapse(&key, e),
        };

        // Victims are chosen under the write lock. A sweep either sees this
        // lease or has already dropped the row checked below.
        let _guard = self.ctx.write_lock.lock().await;
        let lease = self.ctx.leases.acquire(&entry.key, entry.path.clone());
        match self.ctx.store.get_by_key(&entry.key) {
            Ok(Some(current)) if current.path == entry.path => {
                debug!(key = %lease.key(), "Leased cache entry");
                Ok(Some(lease))
            }
            Ok(_) => Ok(None),
            Err(e) => Self::collapse(&key, e),
        }
    }

    /// Turn an internal failure into the public "no value" result.
    fn collapse<T>(key: &CacheKey, err: MediaCacheError) -> Result<Option<T>> {
        match err.root() {
            MediaCacheError::InvalidArgument { field, message } => {
                Err(MediaCacheError::invalid_argument(field.clone(), message.clone()))
            }
            MediaCacheError::Cancelled => {
                debug!(key = %key, "Request cancelled");
                Ok(None)
            }
            // Transfer failures were logged by the transfer itself.
            root if matches!(err, MediaCacheError::Shared(_)) => {
                debug!(key = %key, kind = root.kind(), "Download yielded no value");
                Ok(None)
            }
            root => {
                warn!(key = %key, kind = root.kind(), error = %root, "Cache request failed");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::remove_content_file;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lease_waits_for_running_sweep() {
        let temp_dir = TempDir::new().unwrap();
        let cache = Arc::new(
            MediaCache::builder(temp_dir.path().join("cache"))
                .remote_base_url("http://127.0.0.1:9/objects")
                .build()
                .await
                .unwrap(),
        );
        let picked = temp_dir.path().join("a.jpg");
        std::fs::write(&picked, b"aaaa").unwrap();
        let registered = cache
            .register_local_file(&picked, EntryKind::UserLocal)
            .await
            .unwrap()
            .unwrap();
        let reference = registered.canonical_key.strip_prefix("full:").unwrap().to_string();

        // Hold the lock the way a sweep does while it evicts this entry.
        let guard = cache.ctx.write_lock.lock().await;
        let pending = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.lease(&reference, false).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        cache.ctx.store.delete(&registered.canonical_key).unwrap();
        remove_content_file(&registered.local_path);
        drop(guard);

        assert!(pending.await.unwrap().unwrap().is_none());
        assert_eq!(cache.ctx.leases.leased_keys(), 0);
    }

    #[tokio::test]
    async fn test_lease_reports_entry_key() {
        let temp_dir = TempDir::new().unwrap();
        let cache = MediaCache::builder(temp_dir.path().join("cache"))
            .remote_base_url("http://127.0.0.1:9/objects")
            .build()
            .await
            .unwrap();
        let picked = temp_dir.path().join("a.jpg");
        std::fs::write(&picked, b"aaaa").unwrap();
        let registered = cache
            .register_local_file(&picked, EntryKind::UserLocal)
            .await
            .unwrap()
            .unwrap();
        let reference = registered.canonical_key.strip_prefix("full:").unwrap();

        let lease = cache.lease(reference, false).await.unwrap().unwrap();
        assert_eq!(lease.key(), registered.canonical_key);
        assert_eq!(lease.path(), registered.local_path);
        assert!(cache.ctx.leases.is_leased(&registered.canonical_key));
    }
}
