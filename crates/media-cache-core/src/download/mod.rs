//! Single-flight download coordination.
//!
//! At most one transfer runs per requested key. Callers that miss while a
//! transfer for their key is running wait on the same shared result instead of
//! starting another. Transfers across all keys share a fixed number of permits.
//!
//! Each transfer runs in its own task, so a caller that stops waiting does not
//! stop the transfer other callers depend on. Only the cache-wide shutdown
//! token cancels a transfer.

mod inflight;

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::context::CacheContext;
use crate::error::{MediaCacheError, Result};
use crate::key::{CacheKey, EntryKind};
use crate::network::{RemoteTransport, TransferRequest};
use crate::registrar::{HashingRegistrar, Incoming};
use futures::FutureExt;
use inflight::{DownloadOutcome, InFlightGuard, InFlightMap, SharedDownload};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempPath;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub struct DownloadCoordinator {
    ctx: Arc<CacheContext>,
    registrar: Arc<HashingRegistrar>,
    transport: Arc<dyn RemoteTransport>,
    permits: Arc<Semaphore>,
    inflight: InFlightMap,
    shutdown: CancellationToken,
}

impl DownloadCoordinator {
    pub(crate) fn new(
        ctx: Arc<CacheContext>,
        registrar: Arc<HashingRegistrar>,
        transport: Arc<dyn RemoteTransport>,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.config.download_concurrency.max(1)));
        Self {
            ctx,
            registrar,
            transport,
            permits,
            inflight: InFlightMap::default(),
            shutdown,
        }
    }

    /// Local path for `key`, downloading it if it is not cached.
    ///
    /// `cancel` only ends this caller's wait.
    pub async fn get_or_download(
        &self,
        key: &CacheKey,
        credential: &str,
        display_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let storage_key = key.as_storage_key();

        if let Some(entry) = self.ctx.lookup(&storage_key).await? {
            self.ctx.counters.record_hit();
            debug!(key = %storage_key, canonical = %entry.key, "Cache hit");
            return Ok(entry.path);
        }
        self.ctx.counters.record_miss();

        let download = self.join_or_start(key, &storage_key, credential, display_name);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key = %storage_key, "Caller stopped waiting for download");
                Err(MediaCacheError::Cancelled)
            }
            outcome = download => outcome.map_err(MediaCacheError::Shared),
        }
    }

    /// Number of transfers currently running or queued for a permit.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Cancel running transfers and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.permits.close();
    }

    fn join_or_start(
        &self,
        key: &CacheKey,
        storage_key: &str,
        credential: &str,
        display_name: Option<&str>,
    ) -> SharedDownload {
        let mut inflight = self.inflight.lock();
        if let Some(running) = inflight.get(storage_key) {
            self.ctx.counters.record_coalesced();
            debug!(key = %storage_key, "Joining in-flight download");
            return running.clone();
        }

        let job = TransferJob {
            ctx: Arc::clone(&self.ctx),
            registrar: Arc::clone(&self.registrar),
            transport: Arc::clone(&self.transport),
            permits: Arc::clone(&self.permits),
            shutdown: self.shutdown.clone(),
            storage_key: storage_key.to_string(),
            kind: EntryKind::for_download(key.variant()),
            extension: key.extension_hint(display_name),
            request: TransferRequest {
                credential: credential.to_string(),
                reference: key.reference().to_string(),
            },
            _guard: self.inflight.completion_guard(storage_key.to_string()),
        };

        let task = tokio::spawn(job.run());
        let download = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Arc::new(MediaCacheError::Other(format!(
                    "Download task failed: {}",
                    e
                )))),
            }
        }
        .boxed()
        .shared();

        inflight.insert(storage_key.to_string(), download.clone());
        download
    }
}

/// Everything one transfer task needs, owned.
struct TransferJob {
    ctx: Arc<CacheContext>,
    registrar: Arc<HashingRegistrar>,
    transport: Arc<dyn RemoteTransport>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    storage_key: String,
    kind: EntryKind,
    extension: Option<String>,
    request: TransferRequest,
    /// Dropped last, after the outcome is final.
    _guard: InFlightGuard,
}

impl TransferJob {
    async fn run(self) -> DownloadOutcome {
        match self.execute().await {
            Ok(path) => Ok(path),
            Err(e) => {
                self.ctx.counters.record_failure();
                if matches!(e, MediaCacheError::Cancelled) {
                    info!(key = %self.storage_key, "Download cancelled");
                } else {
                    warn!(
                        key = %self.storage_key,
                        reference = %self.request.reference,
                        kind = e.kind(),
                        error = %e,
                        "Download failed"
                    );
                }
                Err(Arc::new(e))
            }
        }
    }

    async fn execute(&self) -> Result<PathBuf> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| MediaCacheError::Cancelled)?;
        self.shutdown.check()?;

        // Another path may have filled the key while this one queued.
        if let Some(entry) = self.ctx.lookup(&self.storage_key).await? {
            debug!(key = %self.storage_key, "Filled while queued for a permit");
            return Ok(entry.path);
        }

        self.ctx.counters.record_transfer();
        let staged = self.staging_file()?;
        let bytes = self
            .transport
            .fetch(&self.request, &staged, &self.shutdown)
            .await?;
        info!(
            key = %self.storage_key,
            reference = %self.request.reference,
            bytes,
            "Downloaded"
        );

        let registration = self
            .registrar
            .register(
                &self.storage_key,
                Incoming::Staged(staged),
                self.kind,
                self.extension.as_deref(),
            )
            .await?;
        Ok(registration.path)
    }

    fn staging_file(&self) -> Result<TempPath> {
        let staging_dir = self.ctx.config.staging_dir();
        std::fs::create_dir_all(&staging_dir)
            .map_err(|e| MediaCacheError::io_with_path(e, &staging_dir))?;
        let file = tempfile::Builder::new()
            .prefix(NetworkConfig::DOWNLOAD_TEMP_PREFIX)
            .suffix(NetworkConfig::DOWNLOAD_TEMP_SUFFIX)
            .tempfile_in(&staging_dir)
            .map_err(|e| MediaCacheError::io_with_path(e, &staging_dir))?;
        Ok(file.into_temp_path())
    }
}
