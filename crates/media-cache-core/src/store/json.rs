//! JSON-file metadata backend.
//!
//! The whole index lives in memory and is rewritten as one snapshot after each
//! mutation. A mutation is applied to a copy first and only becomes visible
//! once the snapshot has been promoted on disk, so a failed write leaves both
//! memory and disk at the previous state.

use super::{AliasEntry, AliasTable, CacheEntry, ContentStore, MetadataStore};
use crate::error::{MediaCacheError, Result};
use crate::key::Variant;
use crate::metadata::{atomic_read_json, atomic_write_json, backup_path_for, remove_stale_staged};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, CacheEntry>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

impl Default for IndexSnapshot {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }
}

impl IndexSnapshot {
    fn sorted_by_access(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.last_access
                .cmp(&b.last_access)
                .then_with(|| a.key.cmp(&b.key))
        });
        entries
    }
}

/// Metadata persisted as a single JSON document.
pub struct JsonStore {
    path: PathBuf,
    state: Mutex<IndexSnapshot>,
}

impl JsonStore {
    /// Load the index at `path`, or start empty.
    ///
    /// Leftover staged writes are removed first. If the index cannot be parsed
    /// the backup from the previous write is tried, then an empty index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let stale = remove_stale_staged(&path);
        if stale > 0 {
            info!(path = %path.display(), count = stale, "Removed interrupted index writes");
        }

        let snapshot = Self::load(&path);
        debug!(
            path = %path.display(),
            entries = snapshot.entries.len(),
            aliases = snapshot.aliases.len(),
            "Opened JSON metadata store"
        );

        Ok(Self {
            path,
            state: Mutex::new(snapshot),
        })
    }

    fn load(path: &Path) -> IndexSnapshot {
        match atomic_read_json::<IndexSnapshot>(path) {
            Ok(Some(snapshot)) => return snapshot,
            Ok(None) => return IndexSnapshot::default(),
            Err(e) => warn!(
                path = %path.display(),
                error = %e,
                "Metadata index unreadable, trying backup"
            ),
        }

        let backup = backup_path_for(path);
        match atomic_read_json::<IndexSnapshot>(&backup) {
            Ok(Some(snapshot)) => {
                warn!(path = %backup.display(), "Recovered metadata index from backup");
                snapshot
            }
            Ok(None) => IndexSnapshot::default(),
            Err(e) => {
                warn!(
                    path = %backup.display(),
                    error = %e,
                    "Backup index unreadable, starting empty"
                );
                IndexSnapshot::default()
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, IndexSnapshot>> {
        self.state.lock().map_err(|e| MediaCacheError::Database {
            message: format!("Failed to lock metadata index: {}", e),
            source: None,
        })
    }

    fn read<T>(&self, f: impl FnOnce(&IndexSnapshot) -> T) -> Result<T> {
        let guard = self.lock()?;
        Ok(f(&guard))
    }

    /// Apply `f` to a copy, persist it, then publish it.
    ///
    /// `f` returns `(changed, value)`; an unchanged copy is not written.
    fn mutate<T>(&self, f: impl FnOnce(&mut IndexSnapshot) -> (bool, T)) -> Result<T> {
        let mut guard = self.lock()?;
        let mut next = guard.clone();
        let (changed, value) = f(&mut next);
        if changed {
            atomic_write_json(&self.path, &next, true)?;
            *guard = next;
        }
        Ok(value)
    }
}

impl ContentStore for JsonStore {
    fn get_by_key(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.read(|s| s.entries.get(key).cloned())
    }

    fn get_by_hash(&self, hash: &str, variant: Variant) -> Result<Option<CacheEntry>> {
        self.read(|s| {
            s.entries
                .values()
                .filter(|e| e.content_hash == hash && e.variant() == variant)
                .max_by_key(|e| e.last_access)
                .cloned()
        })
    }

    fn touch(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        self.mutate(|s| match s.entries.get_mut(key) {
            Some(entry) if entry.last_access < now => {
                entry.last_access = now;
                (true, true)
            }
            Some(_) => (false, true),
            None => (false, false),
        })
    }

    fn upsert(&self, entry: &CacheEntry) -> Result<()> {
        self.mutate(|s| {
            s.entries.insert(entry.key.clone(), entry.clone());
            (true, ())
        })
    }

    fn delete(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.mutate(|s| {
            let removed = s.entries.remove(key);
            (removed.is_some(), removed)
        })
    }

    fn list_oldest(&self, limit: usize) -> Result<Vec<CacheEntry>> {
        self.read(|s| {
            let mut entries = s.sorted_by_access();
            entries.truncate(limit);
            entries
        })
    }

    fn list_all(&self) -> Result<Vec<CacheEntry>> {
        self.read(IndexSnapshot::sorted_by_access)
    }

    fn total_bytes(&self) -> Result<u64> {
        self.read(|s| s.entries.values().map(|e| e.size_bytes).sum())
    }

    fn entry_count(&self) -> Result<usize> {
        self.read(|s| s.entries.len())
    }
}

impl AliasTable for JsonStore {
    fn resolve_alias(&self, alias: &str) -> Result<Option<String>> {
        self.read(|s| s.aliases.get(alias).cloned())
    }

    fn register_alias(&self, alias: &str, canonical: &str) -> Result<()> {
        self.mutate(|s| {
            let previous = s.aliases.insert(alias.to_string(), canonical.to_string());
            (previous.as_deref() != Some(canonical), ())
        })
    }

    fn remove_alias(&self, alias: &str) -> Result<bool> {
        self.mutate(|s| {
            let removed = s.aliases.remove(alias).is_some();
            (removed, removed)
        })
    }

    fn remove_aliases_to(&self, canonical: &str) -> Result<usize> {
        self.mutate(|s| {
            let before = s.aliases.len();
            s.aliases.retain(|_, target| target != canonical);
            let removed = before - s.aliases.len();
            (removed > 0, removed)
        })
    }

    fn list_aliases(&self) -> Result<Vec<AliasEntry>> {
        self.read(|s| {
            s.aliases
                .iter()
                .map(|(alias, canonical)| AliasEntry {
                    alias: alias.clone(),
                    canonical: canonical.clone(),
                })
                .collect()
        })
    }
}

impl MetadataStore for JsonStore {
    fn clear(&self) -> Result<()> {
        self.mutate(|s| {
            let changed = !s.entries.is_empty() || !s.aliases.is_empty();
            s.entries.clear();
            s.aliases.clear();
            (changed, ())
        })
    }
}
