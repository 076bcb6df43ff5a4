//! Map of transfers currently running, one per requested key.

use crate::error::MediaCacheError;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Result every coalesced caller receives.
pub(crate) type DownloadOutcome = std::result::Result<PathBuf, Arc<MediaCacheError>>;

pub(crate) type SharedDownload = Shared<BoxFuture<'static, DownloadOutcome>>;

#[derive(Default, Clone)]
pub(crate) struct InFlightMap {
    inner: Arc<Mutex<HashMap<String, SharedDownload>>>,
}

impl InFlightMap {
    pub fn lock(&self) -> MutexGuard<'_, HashMap<String, SharedDownload>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Guard that removes `key` when the transfer task ends, however it ends.
    pub fn completion_guard(&self, key: String) -> InFlightGuard {
        InFlightGuard {
            map: self.clone(),
            key,
        }
    }
}

pub(crate) struct InFlightGuard {
    map: InFlightMap,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.lock().remove(&self.key);
    }
}
