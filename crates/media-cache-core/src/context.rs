//! State shared by the cache components.

use crate::clock::AccessClock;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::hashing;
use crate::lease::LeaseRegistry;
use crate::stats::CacheCounters;
use crate::store::{CacheEntry, MetadataStore};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub(crate) struct CacheContext {
    pub config: CacheConfig,
    pub store: Arc<dyn MetadataStore>,
    pub clock: AccessClock,
    pub counters: CacheCounters,
    pub leases: Arc<LeaseRegistry>,
    /// Serializes every change to which entry owns which file: registration,
    /// eviction, stale-entry cleanup and maintenance. Held for metadata work and
    /// renames only, never across a transfer or a hash.
    pub write_lock: Mutex<()>,
}

impl CacheContext {
    pub fn new(config: CacheConfig, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            config,
            store,
            clock: AccessClock::new(),
            counters: CacheCounters::new(),
            leases: Arc::new(LeaseRegistry::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Resolve `key` through the alias table and return a valid entry.
    ///
    /// A valid hit is touched. A stale entry is dropped, and an alias whose
    /// target no longer exists is removed; both report a miss.
    pub async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        let alias_target = self.store.resolve_alias(key)?;
        let canonical = alias_target.as_deref().unwrap_or(key);

        let Some(mut entry) = self.store.get_by_key(canonical)? else {
            if let Some(target) = alias_target.as_deref() {
                self.remove_dangling_alias(key, target).await;
            }
            return Ok(None);
        };

        if !self.is_intact(&entry).await {
            debug!(key = %entry.key, path = %entry.path.display(), "Cached file is stale");
            self.discard_stale(&entry).await;
            if let Some(target) = alias_target.as_deref() {
                self.remove_dangling_alias(key, target).await;
            }
            return Ok(None);
        }

        let now = self.clock.now();
        self.store.touch(&entry.key, now)?;
        if entry.last_access < now {
            entry.last_access = now;
        }
        Ok(Some(entry))
    }

    /// Whether `entry`'s file still backs it.
    ///
    /// Checks for a regular file of the recorded size, and re-hashes when
    /// `verify_on_hit` is set.
    pub async fn is_intact(&self, entry: &CacheEntry) -> bool {
        match tokio::fs::metadata(&entry.path).await {
            Ok(meta) if meta.is_file() && meta.len() == entry.size_bytes => {}
            _ => return false,
        }
        if !self.config.verify_on_hit {
            return true;
        }
        match hashing::verify_digest(entry.path.clone(), &entry.content_hash).await {
            Ok(matches) => matches,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Failed to verify cached file");
                false
            }
        }
    }

    /// Drop a stale entry, unless it was replaced since it was read.
    async fn discard_stale(&self, stale: &CacheEntry) {
        let _guard = self.write_lock.lock().await;
        match self.store.get_by_key(&stale.key) {
            Ok(Some(current)) if current.path == stale.path && current.content_hash == stale.content_hash => {}
            Ok(_) => return,
            Err(e) => {
                warn!(key = %stale.key, error = %e, "Failed to re-read stale entry");
                return;
            }
        }
        if let Err(e) = self.store.delete(&stale.key) {
            warn!(key = %stale.key, error = %e, "Failed to delete stale entry");
            return;
        }
        if self.leases.is_leased(&stale.key) {
            debug!(key = %stale.key, "Stale file is leased, leaving it for reconcile");
            return;
        }
        remove_content_file(&stale.path);
    }

    async fn remove_dangling_alias(&self, alias: &str, target: &str) {
        let _guard = self.write_lock.lock().await;
        let still_dangling = matches!(self.store.resolve_alias(alias), Ok(Some(ref t)) if t == target)
            && matches!(self.store.get_by_key(target), Ok(None));
        if !still_dangling {
            return;
        }
        match self.store.remove_alias(alias) {
            Ok(_) => debug!(key = %alias, target = %target, "Removed dangling alias"),
            Err(e) => warn!(key = %alias, error = %e, "Failed to remove dangling alias"),
        }
    }
}

/// Best-effort removal of a content file. A missing file counts as removed.
pub(crate) fn remove_content_file(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove cached file");
            false
        }
    }
}
