//! Durable metadata for cached content.
//!
//! Two tables: cache entries keyed by canonical key, and aliases that redirect
//! secondary keys to a canonical key. Both backends implement the same pair of
//! traits; `open_store` picks one from configuration.
//!
//! All operations are synchronous and brief. Every mutation is atomic: a reader
//! never sees a half-written row, and a crash leaves either the old or the new
//! state on disk.

mod json;
mod sqlite;

pub use json::JsonStore;
pub use sqlite::SqliteStore;

use crate::config::{CacheConfig, StoreBackend};
use crate::error::Result;
use crate::key::{EntryKind, Variant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// A stored piece of content. The entry exclusively owns `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Canonical key (serialized `CacheKey`).
    pub key: String,
    /// Lowercase hex SHA-256 of the file bytes.
    pub content_hash: String,
    pub kind: EntryKind,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_access: DateTime<Utc>,
}

impl CacheEntry {
    pub fn variant(&self) -> Variant {
        self.kind.variant()
    }
}

/// A non-owning redirection from `alias` to a canonical key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub alias: String,
    pub canonical: String,
}

/// Metadata table of cache entries.
pub trait ContentStore: Send + Sync {
    /// Entry stored under `key`. Does not check that the file exists.
    fn get_by_key(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Entry holding content `hash` within `variant`'s namespace.
    fn get_by_hash(&self, hash: &str, variant: Variant) -> Result<Option<CacheEntry>>;

    /// Move `last_access` forward to `now`. Never moves it backwards.
    ///
    /// Returns `false` when no entry exists under `key`.
    fn touch(&self, key: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Insert or replace an entry's metadata.
    fn upsert(&self, entry: &CacheEntry) -> Result<()>;

    /// Remove the metadata row only, returning what was removed.
    ///
    /// The caller removes the backing file afterwards.
    fn delete(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Up to `limit` entries, least recently accessed first.
    fn list_oldest(&self, limit: usize) -> Result<Vec<CacheEntry>>;

    /// Every entry, least recently accessed first.
    fn list_all(&self) -> Result<Vec<CacheEntry>>;

    /// Sum of `size_bytes` over all entries.
    fn total_bytes(&self) -> Result<u64>;

    /// Number of entries.
    fn entry_count(&self) -> Result<usize>;
}

/// Secondary-key redirections.
pub trait AliasTable: Send + Sync {
    /// Canonical key registered for `alias`, if any.
    fn resolve_alias(&self, alias: &str) -> Result<Option<String>>;

    /// Idempotent upsert of `alias -> canonical`.
    fn register_alias(&self, alias: &str, canonical: &str) -> Result<()>;

    /// Drop the mapping for `alias`. Returns whether one existed.
    fn remove_alias(&self, alias: &str) -> Result<bool>;

    /// Drop every alias pointing at `canonical`. Returns how many were removed.
    fn remove_aliases_to(&self, canonical: &str) -> Result<usize>;

    fn list_aliases(&self) -> Result<Vec<AliasEntry>>;
}

/// Both tables behind one handle.
pub trait MetadataStore: ContentStore + AliasTable {
    /// Remove every entry and alias.
    fn clear(&self) -> Result<()>;
}

/// Open the backend selected by `config`, creating it if needed.
///
/// An unreadable store falls back to an empty one rather than failing.
pub fn open_store(config: &CacheConfig) -> Result<Arc<dyn MetadataStore>> {
    let path = config.index_path();
    let store: Arc<dyn MetadataStore> = match config.backend {
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&path)?),
        StoreBackend::Json => Arc::new(JsonStore::open(&path)?),
    };
    Ok(store)
}
