//! Maintenance methods on MediaCache: removal, sweeps, reconciliation and
//! lifecycle.

use crate::context::{remove_content_file, CacheContext};
use crate::error::{MediaCacheError, Result};
use crate::eviction::SweepReport;
use crate::key::{CacheKey, Variant};
use crate::stats::CacheStats;
use crate::MediaCache;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Rows whose file was missing or had the wrong size.
    pub dropped_entries: usize,
    /// Files under `files/` that no row owned.
    pub orphan_files: usize,
    /// Leftover temporary files removed from `staging/`.
    pub staging_files: usize,
    /// Aliases whose target no longer exists.
    pub dangling_aliases: usize,
}

impl ReconcileReport {
    pub fn has_changes(&self) -> bool {
        self.dropped_entries + self.orphan_files + self.staging_files + self.dangling_aliases > 0
    }
}

impl MediaCache {
    // ========================================
    // Removal
    // ========================================

    /// Delete the content `reference` resolves to, every alias pointing at it
    /// and its file.
    ///
    /// Returns `Ok(false)` when nothing was cached. A leased entry is refused
    /// with [`MediaCacheError::Leased`].
    pub async fn remove(&self, reference: &str, thumbnail: bool) -> Result<bool> {
        let key = CacheKey::new(reference, Variant::from_thumbnail_flag(thumbnail))?;
        match self.remove_key(&key.as_storage_key()).await {
            Ok(removed) => Ok(removed),
            Err(e @ MediaCacheError::Leased { .. }) => Err(e),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to remove cache entry");
                Ok(false)
            }
        }
    }

    async fn remove_key(&self, key: &str) -> Result<bool> {
        let _guard = self.ctx.write_lock.lock().await;
        let store = &self.ctx.store;

        let canonical = store.resolve_alias(key)?.unwrap_or_else(|| key.to_string());
        if self.ctx.leases.is_leased(&canonical) {
            return Err(MediaCacheError::Leased { key: canonical });
        }

        let aliases = store.remove_aliases_to(&canonical)?;
        let alias_removed = store.remove_alias(key)?;
        let Some(entry) = store.delete(&canonical)? else {
            return Ok(alias_removed || aliases > 0);
        };
        remove_content_file(&entry.path);
        info!(
            key = %entry.key,
            bytes = entry.size_bytes,
            aliases,
            "Removed cache entry"
        );
        Ok(true)
    }

    /// Remove every entry, alias and content file. Leased entries stay.
    ///
    /// Returns the number of entries removed.
    pub async fn clear(&self) -> usize {
        let _guard = self.ctx.write_lock.lock().await;
        match self.clear_locked() {
            Ok(removed) => {
                info!(removed, "Cleared media cache");
                removed
            }
            Err(e) => {
                warn!(error = %e, "Failed to clear media cache");
                0
            }
        }
    }

    fn clear_locked(&self) -> Result<usize> {
        let store = &self.ctx.store;
        let entries = store.list_all()?;

        if self.ctx.leases.leased_keys() == 0 {
            store.clear()?;
            for entry in &entries {
                remove_content_file(&entry.path);
            }
            return Ok(entries.len());
        }

        let mut removed = 0;
        for entry in entries {
            if self.ctx.leases.is_leased(&entry.key) {
                debug!(key = %entry.key, "Keeping leased entry");
                continue;
            }
            store.remove_aliases_to(&entry.key)?;
            if store.delete(&entry.key)?.is_some() {
                remove_content_file(&entry.path);
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ========================================
    // Eviction & Reconciliation
    // ========================================

    /// Run one eviction pass now.
    pub async fn sweep(&self) -> SweepReport {
        match self.registrar.sweeper().sweep(None).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Eviction sweep failed");
                SweepReport::default()
            }
        }
    }

    /// Bring metadata and the files on disk back in line.
    ///
    /// Drops rows whose file is missing or truncated, deletes files under
    /// `files/` that no row owns and removes dangling aliases. Leased files are
    /// left alone.
    pub async fn reconcile(&self) -> ReconcileReport {
        match self.reconcile_with_staging(false).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Reconciliation failed");
                ReconcileReport::default()
            }
        }
    }

    /// Reconcile, optionally clearing `staging/`. Staging may only be cleared
    /// while no transfer is running.
    pub(crate) async fn reconcile_with_staging(&self, clean_staging: bool) -> Result<ReconcileReport> {
        let _guard = self.ctx.write_lock.lock().await;
        let ctx = Arc::clone(&self.ctx);
        tokio::task::spawn_blocking(move || reconcile_locked(&ctx, clean_staging))
            .await
            .map_err(|e| MediaCacheError::Other(format!("Reconcile task failed: {}", e)))?
    }

    // ========================================
    // Stats & Lifecycle
    // ========================================

    /// Counters since startup plus the current store size.
    pub async fn stats(&self) -> CacheStats {
        let store = &self.ctx.store;
        let entries = store.entry_count().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to count cache entries");
            0
        });
        let total = store.total_bytes().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read cache size");
            0
        });
        self.ctx
            .counters
            .snapshot(entries, total, self.ctx.config.budget_bytes)
    }

    /// Transfers running or waiting for a permit.
    pub fn in_flight_downloads(&self) -> usize {
        self.downloads.in_flight()
    }

    /// Cancel running transfers and refuse new ones. Waiters see no value.
    pub fn shutdown(&self) {
        info!("Shutting down media cache downloads");
        self.downloads.shutdown();
    }
}

/// Caller holds the write lock.
fn reconcile_locked(ctx: &CacheContext, clean_staging: bool) -> Result<ReconcileReport> {
    let store = &ctx.store;
    let mut report = ReconcileReport::default();

    let mut owned: HashSet<PathBuf> = ctx.leases.leased_paths();
    for entry in store.list_all()? {
        let intact = std::fs::metadata(&entry.path)
            .map(|meta| meta.is_file() && meta.len() == entry.size_bytes)
            .unwrap_or(false);
        if intact {
            owned.insert(entry.path);
            continue;
        }
        if store.delete(&entry.key)?.is_some() {
            debug!(key = %entry.key, path = %entry.path.display(), "Dropping entry without a valid file");
            report.dropped_entries += 1;
        }
    }

    let files_dir = ctx.config.files_dir();
    if files_dir.is_dir() {
        for dir_entry in WalkDir::new(&files_dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
            if !dir_entry.file_type().is_file() || owned.contains(dir_entry.path()) {
                continue;
            }
            debug!(path = %dir_entry.path().display(), "Removing orphan file");
            if remove_content_file(dir_entry.path()) {
                report.orphan_files += 1;
            }
        }
    }

    if clean_staging {
        let staging_dir = ctx.config.staging_dir();
        if staging_dir.is_dir() {
            for dir_entry in WalkDir::new(&staging_dir)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if dir_entry.file_type().is_file() && remove_content_file(dir_entry.path()) {
                    report.staging_files += 1;
                }
            }
        }
    }

    for alias in store.list_aliases()? {
        if store.get_by_key(&alias.canonical)?.is_none() && store.remove_alias(&alias.alias)? {
            debug!(key = %alias.alias, target = %alias.canonical, "Removing dangling alias");
            report.dangling_aliases += 1;
        }
    }

    Ok(report)
}
