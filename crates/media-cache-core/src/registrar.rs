//! Folding new files into the content store.
//!
//! Every file that enters the cache, whether a finished download or a file the
//! user picked, is hashed first. Content already stored in the same variant
//! namespace is linked through an alias instead of being stored twice.

use crate::config::NetworkConfig;
use crate::context::{remove_content_file, CacheContext};
use crate::error::{MediaCacheError, Result};
use crate::eviction::EvictionSweeper;
use crate::hashing::{self, ContentDigest};
use crate::key::{content_file_name, EntryKind};
use crate::store::CacheEntry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tracing::{debug, info, warn};

/// A file about to be registered.
pub enum Incoming {
    /// A file in the staging directory that the cache may move. Deleted on
    /// drop if it is not kept.
    Staged(TempPath),
    /// A file owned by someone else. It is copied, never moved.
    External(PathBuf),
}

/// Where registered content ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Key of the entry that owns the bytes.
    pub canonical_key: String,
    pub path: PathBuf,
    /// The bytes matched an existing entry and were not stored again.
    pub deduplicated: bool,
}

pub struct HashingRegistrar {
    ctx: Arc<CacheContext>,
    sweeper: EvictionSweeper,
}

impl HashingRegistrar {
    pub(crate) fn new(ctx: Arc<CacheContext>) -> Self {
        let sweeper = EvictionSweeper::new(Arc::clone(&ctx));
        Self { ctx, sweeper }
    }

    pub fn sweeper(&self) -> &EvictionSweeper {
        &self.sweeper
    }

    /// Register `incoming` under `key` (a serialized cache key).
    ///
    /// On dedup `key` becomes an alias of the existing entry. Otherwise the
    /// file is placed at `files/<hash>[.thumb][.<ext>]` and a new entry is
    /// stored under `key`. Either way an eviction sweep follows, with the
    /// resulting entry protected.
    pub async fn register(
        &self,
        key: &str,
        incoming: Incoming,
        kind: EntryKind,
        extension: Option<&str>,
    ) -> Result<Registration> {
        match incoming {
            Incoming::Staged(staged) => {
                let digest = hashing::digest_file(staged.to_path_buf()).await?;
                self.finalize(key, staged, digest, kind, extension).await
            }
            Incoming::External(source) => self.register_external(key, &source, kind, extension).await,
        }
    }

    async fn register_external(
        &self,
        key: &str,
        source: &Path,
        kind: EntryKind,
        extension: Option<&str>,
    ) -> Result<Registration> {
        let digest = hashing::digest_file(source.to_path_buf()).await?;

        {
            let _guard = self.ctx.write_lock.lock().await;
            if let Some(registration) = self.link_duplicate(key, &digest, kind).await? {
                self.sweep_after(&registration.canonical_key);
                return Ok(registration);
            }
        }

        let staged = self.copy_to_staging(source).await?;
        let copied = std::fs::metadata(&staged)
            .map_err(|e| MediaCacheError::io_with_path(e, &staged))?
            .len();
        if copied != digest.size_bytes {
            return Err(MediaCacheError::Io {
                message: format!("{} changed while it was being registered", source.display()),
                path: Some(source.to_path_buf()),
                source: None,
            });
        }

        self.finalize(key, staged, digest, kind, extension).await
    }

    async fn copy_to_staging(&self, source: &Path) -> Result<TempPath> {
        let staging_dir = self.ctx.config.staging_dir();
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<TempPath> {
            std::fs::create_dir_all(&staging_dir)
                .map_err(|e| MediaCacheError::io_with_path(e, &staging_dir))?;
            let staged = tempfile::Builder::new()
                .prefix(NetworkConfig::DOWNLOAD_TEMP_PREFIX)
                .suffix(NetworkConfig::DOWNLOAD_TEMP_SUFFIX)
                .tempfile_in(&staging_dir)
                .map_err(|e| MediaCacheError::io_with_path(e, &staging_dir))?
                .into_temp_path();
            std::fs::copy(&source, &staged).map_err(|e| MediaCacheError::io_with_path(e, &source))?;
            std::fs::File::open(&staged)
                .and_then(|f| f.sync_all())
                .map_err(|e| MediaCacheError::io_with_path(e, &staged))?;
            Ok(staged)
        })
        .await
        .map_err(|e| MediaCacheError::Other(format!("Copy task failed: {}", e)))?
    }

    /// Link `key` to an existing intact entry holding the same bytes.
    ///
    /// Caller holds the write lock.
    async fn link_duplicate(
        &self,
        key: &str,
        digest: &ContentDigest,
        kind: EntryKind,
    ) -> Result<Option<Registration>> {
        let store = &self.ctx.store;
        let Some(existing) = store.get_by_hash(&digest.sha256, kind.variant())? else {
            return Ok(None);
        };

        if !self.ctx.is_intact(&existing).await {
            debug!(key = %existing.key, "Duplicate candidate is stale, replacing it");
            store.delete(&existing.key)?;
            if !self.ctx.leases.is_leased(&existing.key) {
                remove_content_file(&existing.path);
            }
            return Ok(None);
        }

        if existing.key != key {
            // The alias shadows any entry still stored under `key`.
            if let Some(replaced) = store.delete(key)? {
                if !self.ctx.leases.is_leased(&replaced.key) {
                    remove_content_file(&replaced.path);
                }
            }
            store.register_alias(key, &existing.key)?;
        }
        store.touch(&existing.key, self.ctx.clock.now())?;
        self.ctx.counters.record_dedup();
        debug!(
            key = %key,
            canonical = %existing.key,
            hash = %digest.sha256,
            "Linked duplicate content"
        );

        Ok(Some(Registration {
            canonical_key: existing.key,
            path: existing.path,
            deduplicated: true,
        }))
    }

    async fn finalize(
        &self,
        key: &str,
        staged: TempPath,
        digest: ContentDigest,
        kind: EntryKind,
        extension: Option<&str>,
    ) -> Result<Registration> {
        let files_dir = self.ctx.config.files_dir();
        let file_name = content_file_name(&digest.sha256, kind.variant(), extension);
        let final_path = files_dir.join(file_name);

        let _guard = self.ctx.write_lock.lock().await;

        if let Some(registration) = self.link_duplicate(key, &digest, kind).await? {
            // `staged` drops here and removes the redundant copy.
            self.sweep_after(&registration.canonical_key);
            return Ok(registration);
        }

        let store = &self.ctx.store;
        let previous = store.get_by_key(key)?;

        std::fs::create_dir_all(&files_dir).map_err(|e| MediaCacheError::io_with_path(e, &files_dir))?;
        staged.persist(&final_path).map_err(|e| MediaCacheError::Io {
            message: format!("Failed to move content into {}", final_path.display()),
            path: Some(final_path.clone()),
            source: Some(e.error),
        })?;

        let entry = CacheEntry {
            key: key.to_string(),
            content_hash: digest.sha256,
            kind,
            path: final_path,
            size_bytes: digest.size_bytes,
            last_access: self.ctx.clock.now(),
        };
        if let Err(e) = store.upsert(&entry) {
            remove_content_file(&entry.path);
            return Err(e);
        }

        // The key is canonical now; an old alias on it would shadow the entry.
        if let Err(e) = store.remove_alias(key) {
            warn!(key = %key, error = %e, "Failed to clear alias on new canonical key");
        }
        if let Some(previous) = previous {
            if previous.path != entry.path && !self.ctx.leases.is_leased(&previous.key) {
                remove_content_file(&previous.path);
            }
        }

        info!(
            key = %entry.key,
            hash = %entry.content_hash,
            bytes = entry.size_bytes,
            kind = entry.kind.as_str(),
            "Stored new content"
        );

        self.sweep_after(&entry.key);
        Ok(Registration {
            canonical_key: entry.key,
            path: entry.path,
            deduplicated: false,
        })
    }

    /// Best-effort sweep protecting `key`. Caller holds the write lock.
    fn sweep_after(&self, key: &str) {
        if let Err(e) = self.sweeper.sweep_locked(Some(key)) {
            warn!(key = %key, error = %e, "Eviction sweep failed");
        }
    }
}

/// Extension to keep for a registered local file.
pub(crate) fn extension_of(path: &Path) -> Option<String> {
    crate::key::sanitize_extension(path.extension().and_then(|e| e.to_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::key::Variant;
    use crate::store::SqliteStore;
    use std::io::Write;
    use tempfile::TempDir;

    fn registrar(root: &Path, budget: u64) -> HashingRegistrar {
        let mut config = CacheConfig::new(root);
        config.budget_bytes = budget;
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        HashingRegistrar::new(Arc::new(CacheContext::new(config, store)))
    }

    fn staged(registrar: &HashingRegistrar, bytes: &[u8]) -> Incoming {
        let staging = registrar.ctx.config.staging_dir();
        std::fs::create_dir_all(&staging).unwrap();
        let mut file = tempfile::NamedTempFile::new_in(&staging).unwrap();
        file.write_all(bytes).unwrap();
        Incoming::Staged(file.into_temp_path())
    }

    #[tokio::test]
    async fn test_new_content_is_stored_by_hash() {
        let temp_dir = TempDir::new().unwrap();
        let registrar = registrar(temp_dir.path(), 1_000);

        let reg = registrar
            .register("full:x/y.jpg", staged(&registrar, b"hello world"), EntryKind::FullFile, Some("jpg"))
            .await
            .unwrap();

        assert!(!reg.deduplicated);
        assert_eq!(reg.canonical_key, "full:x/y.jpg");
        assert_eq!(
            reg.path,
            temp_dir
                .path()
                .join("files")
                .join("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9.jpg")
        );
        assert_eq!(std::fs::read(&reg.path).unwrap(), b"hello world");

        let entry = registrar.ctx.store.get_by_key("full:x/y.jpg").unwrap().unwrap();
        assert_eq!(entry.size_bytes, 11);
        assert_eq!(entry.kind, EntryKind::FullFile);
    }

    #[tokio::test]
    async fn test_duplicate_bytes_become_alias() {
        let temp_dir = TempDir::new().unwrap();
        let registrar = registrar(temp_dir.path(), 1_000);

        let first = registrar
            .register("full:a.jpg", staged(&registrar, b"same"), EntryKind::FullFile, Some("jpg"))
            .await
            .unwrap();
        let second = registrar
            .register("full:b.jpg", staged(&registrar, b"same"), EntryKind::FullFile, Some("jpg"))
            .await
            .unwrap();

        assert!(second.deduplicated);
        assert_eq!(second.canonical_key, "full:a.jpg");
        assert_eq!(second.path, first.path);
        assert_eq!(
            registrar.ctx.store.resolve_alias("full:b.jpg").unwrap().as_deref(),
            Some("full:a.jpg")
        );
        assert_eq!(registrar.ctx.store.entry_count().unwrap(), 1);

        let staging_left = std::fs::read_dir(registrar.ctx.config.staging_dir()).unwrap().count();
        assert_eq!(staging_left, 0);
    }

    #[tokio::test]
    async fn test_thumbnail_and_full_never_dedup() {
        let temp_dir = TempDir::new().unwrap();
        let registrar = registrar(temp_dir.path(), 1_000);

        let full = registrar
            .register("full:x/y.jpg", staged(&registrar, b"pixels"), EntryKind::FullFile, Some("jpg"))
            .await
            .unwrap();
        let thumb = registrar
            .register(
                "thumb:x/y.jpg",
                staged(&registrar, b"pixels"),
                EntryKind::Thumbnail,
                Some("jpg"),
            )
            .await
            .unwrap();

        assert!(!thumb.deduplicated);
        assert_ne!(full.path, thumb.path);
        assert!(thumb.path.to_string_lossy().ends_with(".thumb.jpg"));
        assert_eq!(registrar.ctx.store.entry_count().unwrap(), 2);

        let digest = hashing::compute_digest(&full.path).unwrap();
        let by_hash = registrar.ctx.store.get_by_hash(&digest.sha256, Variant::Thumbnail).unwrap();
        assert_eq!(by_hash.unwrap().key, "thumb:x/y.jpg");
    }

    #[tokio::test]
    async fn test_external_file_is_copied_not_moved() {
        let temp_dir = TempDir::new().unwrap();
        let registrar = registrar(temp_dir.path().join("cache").as_path(), 1_000);
        let source = temp_dir.path().join("picked.PNG");
        std::fs::write(&source, b"user bytes").unwrap();

        let reg = registrar
            .register(
                "full:local/1",
                Incoming::External(source.clone()),
                EntryKind::UserLocal,
                extension_of(&source).as_deref(),
            )
            .await
            .unwrap();

        assert!(source.exists());
        assert!(reg.path.to_string_lossy().ends_with(".png"));
        assert_eq!(std::fs::read(&reg.path).unwrap(), b"user bytes");
        assert_eq!(
            registrar.ctx.store.get_by_key("full:local/1").unwrap().unwrap().kind,
            EntryKind::UserLocal
        );
    }

    #[tokio::test]
    async fn test_stale_duplicate_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let registrar = registrar(temp_dir.path(), 1_000);

        let first = registrar
            .register("full:a.jpg", staged(&registrar, b"same"), EntryKind::FullFile, Some("jpg"))
            .await
            .unwrap();
        std::fs::remove_file(&first.path).unwrap();

        let second = registrar
            .register("full:b.jpg", staged(&registrar, b"same"), EntryKind::FullFile, Some("jpg"))
            .await
            .unwrap();

        assert!(!second.deduplicated);
        assert_eq!(second.canonical_key, "full:b.jpg");
        assert!(second.path.exists());
        assert!(registrar.ctx.store.get_by_key("full:a.jpg").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registration_triggers_sweep() {
        let temp_dir = TempDir::new().unwrap();
        let registrar = registrar(temp_dir.path(), 10);

        let first = registrar
            .register("full:a", staged(&registrar, b"0123456789"), EntryKind::FullFile, None)
            .await
            .unwrap();
        let second = registrar
            .register("full:b", staged(&registrar, b"abcdefghij"), EntryKind::FullFile, None)
            .await
            .unwrap();

        assert!(!first.path.exists());
        assert!(second.path.exists());
        assert_eq!(registrar.ctx.store.total_bytes().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_missing_external_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let registrar = registrar(temp_dir.path(), 1_000);

        let result = registrar
            .register(
                "full:local/2",
                Incoming::External(temp_dir.path().join("nope.jpg")),
                EntryKind::UserLocal,
                None,
            )
            .await;
        assert!(matches!(result, Err(MediaCacheError::Io { .. })));
    }
}
