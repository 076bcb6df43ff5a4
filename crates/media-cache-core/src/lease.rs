//! Read leases on cache entries.
//!
//! A caller that is about to read a cached file can take a lease on its
//! canonical key. While any lease is held, eviction skips the entry and an
//! explicit remove is refused.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct LeaseSlot {
    count: usize,
    path: PathBuf,
}

/// Reference counts of leased canonical keys.
#[derive(Debug, Default)]
pub struct LeaseRegistry {
    slots: Mutex<HashMap<String, LeaseSlot>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, LeaseSlot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take a lease on `key` for `path`. Released when the guard drops.
    pub fn acquire(self: &Arc<Self>, key: &str, path: PathBuf) -> CacheLease {
        self.slots()
            .entry(key.to_string())
            .or_insert_with(|| LeaseSlot {
                count: 0,
                path: path.clone(),
            })
            .count += 1;
        CacheLease {
            registry: Arc::clone(self),
            key: key.to_string(),
            path,
        }
    }

    pub fn is_leased(&self, key: &str) -> bool {
        self.slots().get(key).is_some_and(|slot| slot.count > 0)
    }

    /// Files currently held by a lease.
    pub fn leased_paths(&self) -> HashSet<PathBuf> {
        self.slots().values().map(|slot| slot.path.clone()).collect()
    }

    /// Number of keys with at least one lease.
    pub fn leased_keys(&self) -> usize {
        self.slots().len()
    }

    fn release(&self, key: &str) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(key) {
            slot.count = slot.count.saturating_sub(1);
            if slot.count == 0 {
                slots.remove(key);
            }
        }
    }
}

/// Guard keeping a cached file out of eviction.
#[derive(Debug)]
pub struct CacheLease {
    registry: Arc<LeaseRegistry>,
    key: String,
    path: PathBuf,
}

impl CacheLease {
    /// Canonical key of the leased entry.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}
