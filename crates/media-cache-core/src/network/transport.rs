//! Seam between the download coordinator and the remote object store.
//!
//! A transport writes one object to a staging path and reports its size. The
//! built-in implementation is [`HttpTransport`](super::HttpTransport); tests
//! substitute in-memory fakes.

use crate::cancel::CancellationToken;
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// One remote object to fetch.
#[derive(Clone)]
pub struct TransferRequest {
    /// Bearer credential. Empty means anonymous.
    pub credential: String,
    /// Path of the object within the remote store.
    pub reference: String,
}

impl std::fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRequest")
            .field("credential", &"<redacted>")
            .field("reference", &self.reference)
            .finish()
    }
}

/// Fetches remote objects into local files.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Write the object's bytes to `dest`, replacing any existing content.
    ///
    /// Returns the number of bytes written. Must return
    /// [`crate::MediaCacheError::Cancelled`] promptly once `cancel` fires. On
    /// error the contents of `dest` are unspecified; the caller discards it.
    async fn fetch(
        &self,
        request: &TransferRequest,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64>;
}
