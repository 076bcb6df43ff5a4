//! Size-bounded LRU eviction.

use crate::context::{remove_content_file, CacheContext};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub evicted: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
    /// Still over budget because every remaining candidate was protected,
    /// leased, or the batch cap was reached.
    pub exhausted: bool,
}

/// Removes least recently accessed entries until the store fits its budget.
pub struct EvictionSweeper {
    ctx: Arc<CacheContext>,
}

impl EvictionSweeper {
    pub(crate) fn new(ctx: Arc<CacheContext>) -> Self {
        Self { ctx }
    }

    /// Take the write lock and sweep.
    pub async fn sweep(&self, protected: Option<&str>) -> Result<SweepReport> {
        let _guard = self.ctx.write_lock.lock().await;
        self.sweep_locked(protected)
    }

    /// Sweep while the caller holds the context's write lock.
    ///
    /// `protected` (the entry whose insertion triggered the sweep) and leased
    /// entries are never removed. Each victim's row goes first, then its file;
    /// a file that cannot be removed is logged and left behind.
    pub(crate) fn sweep_locked(&self, protected: Option<&str>) -> Result<SweepReport> {
        let config = &self.ctx.config;
        let store = &self.ctx.store;
        let budget = config.budget_bytes;

        let mut total = store.total_bytes()?;
        let mut report = SweepReport {
            remaining_bytes: total,
            ..SweepReport::default()
        };
        if total <= budget {
            return Ok(report);
        }

        let mut skipped: HashSet<String> = HashSet::new();
        let mut batches = 0;

        'batches: while total > budget && batches < config.max_eviction_batches {
            batches += 1;
            let candidates = store.list_oldest(config.eviction_batch_size + skipped.len())?;
            let mut progressed = false;

            for candidate in candidates {
                if skipped.contains(&candidate.key) {
                    continue;
                }
                if protected == Some(candidate.key.as_str()) || self.ctx.leases.is_leased(&candidate.key) {
                    debug!(key = %candidate.key, "Skipping protected entry");
                    skipped.insert(candidate.key);
                    continue;
                }

                let removed = match store.delete(&candidate.key) {
                    Ok(Some(removed)) => removed,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(key = %candidate.key, error = %e, "Failed to evict entry");
                        skipped.insert(candidate.key);
                        continue;
                    }
                };
                remove_content_file(&removed.path);

                total = total.saturating_sub(removed.size_bytes);
                report.evicted += 1;
                report.freed_bytes += removed.size_bytes;
                self.ctx.counters.record_eviction(removed.size_bytes);
                progressed = true;
                debug!(key = %removed.key, bytes = removed.size_bytes, "Evicted entry");

                if total <= budget {
                    break 'batches;
                }
            }

            if !progressed {
                break;
            }
        }

        report.remaining_bytes = total;
        report.exhausted = total > budget;

        if report.evicted > 0 {
            info!(
                evicted = report.evicted,
                bytes = report.freed_bytes,
                remaining = report.remaining_bytes,
                budget,
                "Eviction sweep finished"
            );
        }
        if report.exhausted {
            warn!(
                remaining = report.remaining_bytes,
                budget, "Cache still over budget after sweep"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::key::EntryKind;
    use crate::store::{CacheEntry, SqliteStore};
    use chrono::{Duration, TimeZone, Utc};
    use std::path::Path;
    use tempfile::TempDir;

    fn sweeper(root: &Path, budget: u64, batch: usize, max_batches: usize) -> EvictionSweeper {
        let mut config = CacheConfig::new(root);
        config.budget_bytes = budget;
        config.eviction_batch_size = batch;
        config.max_eviction_batches = max_batches;
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        EvictionSweeper::new(Arc::new(CacheContext::new(config, store)))
    }

    /// Store `key` with `size` bytes, `age` seconds after a fixed epoch.
    fn insert(sweeper: &EvictionSweeper, root: &Path, key: &str, size: usize, age: i64) -> CacheEntry {
        let path = root.join(format!("{}.bin", key.replace(':', "_")));
        std::fs::write(&path, vec![0u8; size]).unwrap();
        let entry = CacheEntry {
            key: key.to_string(),
            content_hash: format!("hash-{key}"),
            kind: EntryKind::FullFile,
            path,
            size_bytes: size as u64,
            last_access: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(age),
        };
        sweeper.ctx.store.upsert(&entry).unwrap();
        entry
    }

    fn keys(sweeper: &EvictionSweeper) -> Vec<String> {
        sweeper
            .ctx
            .store
            .list_all()
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect()
    }

    #[tokio::test]
    async fn test_under_budget_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let sweeper = sweeper(temp_dir.path(), 1000, 100, 16);
        insert(&sweeper, temp_dir.path(), "full:a", 100, 1);

        let report = sweeper.sweep(None).await.unwrap();
        assert_eq!(report.evicted, 0);
        assert_eq!(report.remaining_bytes, 100);
        assert!(!report.exhausted);
    }

    #[tokio::test]
    async fn test_evicts_oldest_first_until_under_budget() {
        let temp_dir = TempDir::new().unwrap();
        let sweeper = sweeper(temp_dir.path(), 250, 100, 16);
        let a = insert(&sweeper, temp_dir.path(), "full:a", 100, 1);
        let b = insert(&sweeper, temp_dir.path(), "full:b", 100, 2);
        insert(&sweeper, temp_dir.path(), "full:c", 100, 3);

        let report = sweeper.sweep(Some("full:c")).await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.freed_bytes, 100);
        assert_eq!(report.remaining_bytes, 200);
        assert!(!a.path.exists());
        assert!(b.path.exists());
        assert_eq!(keys(&sweeper), vec!["full:b", "full:c"]);
    }

    #[tokio::test]
    async fn test_protected_and_leased_entries_survive() {
        let temp_dir = TempDir::new().unwrap();
        let sweeper = sweeper(temp_dir.path(), 100, 100, 16);
        let a = insert(&sweeper, temp_dir.path(), "full:a", 100, 1);
        insert(&sweeper, temp_dir.path(), "full:b", 100, 2);
        insert(&sweeper, temp_dir.path(), "full:c", 100, 3);

        let _lease = sweeper.ctx.leases.acquire("full:a", a.path.clone());
        let report = sweeper.sweep(Some("full:c")).await.unwrap();

        assert_eq!(report.evicted, 1);
        assert!(report.exhausted);
        assert_eq!(report.remaining_bytes, 200);
        assert_eq!(keys(&sweeper), vec!["full:a", "full:c"]);
    }

    #[tokio::test]
    async fn test_small_batches_loop_until_under_budget() {
        let temp_dir = TempDir::new().unwrap();
        let sweeper = sweeper(temp_dir.path(), 100, 2, 16);
        for i in 0..6 {
            insert(&sweeper, temp_dir.path(), &format!("full:{i}"), 50, i);
        }

        let report = sweeper.sweep(None).await.unwrap();
        assert_eq!(report.evicted, 4);
        assert_eq!(report.remaining_bytes, 100);
        assert!(!report.exhausted);
        assert_eq!(keys(&sweeper), vec!["full:4", "full:5"]);
    }

    #[tokio::test]
    async fn test_batch_cap_bounds_one_sweep() {
        let temp_dir = TempDir::new().unwrap();
        let sweeper = sweeper(temp_dir.path(), 50, 1, 2);
        for i in 0..5 {
            insert(&sweeper, temp_dir.path(), &format!("full:{i}"), 50, i);
        }

        let report = sweeper.sweep(None).await.unwrap();
        assert_eq!(report.evicted, 2);
        assert!(report.exhausted);

        // The next sweep picks up where this one stopped.
        let report = sweeper.sweep(None).await.unwrap();
        assert_eq!(report.evicted, 2);
        assert!(!report.exhausted);
    }

    #[tokio::test]
    async fn test_missing_file_does_not_block_eviction() {
        let temp_dir = TempDir::new().unwrap();
        let sweeper = sweeper(temp_dir.path(), 100, 100, 16);
        let a = insert(&sweeper, temp_dir.path(), "full:a", 100, 1);
        insert(&sweeper, temp_dir.path(), "full:b", 100, 2);
        std::fs::remove_file(&a.path).unwrap();

        let report = sweeper.sweep(None).await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(keys(&sweeper), vec!["full:b"]);
    }
}
