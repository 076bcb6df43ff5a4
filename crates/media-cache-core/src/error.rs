//! Error types for the media cache.
//!
//! Internal boundaries return these errors so callers can tell failure causes
//! apart for logging. The public `MediaCache` API collapses most of them into
//! `None`, keeping only `InvalidArgument` as a hard error.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for the media cache.
#[derive(Debug, Error)]
pub enum MediaCacheError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Optional cause description
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Download failed for {reference}: {message}")]
    DownloadFailed {
        reference: String,
        /// HTTP status, when the remote answered at all
        status: Option<u16>,
        message: String,
    },

    #[error("Download cancelled")]
    Cancelled,

    // Metadata store errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Contract violations
    #[error("Invalid argument {field}: {message}")]
    InvalidArgument { field: String, message: String },

    #[error("Entry is in use: {key}")]
    Leased { key: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A failure shared by every caller coalesced onto one download.
    #[error(transparent)]
    Shared(Arc<MediaCacheError>),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for media cache operations.
pub type Result<T> = std::result::Result<T, MediaCacheError>;

impl From<std::io::Error> for MediaCacheError {
    fn from(err: std::io::Error) -> Self {
        MediaCacheError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MediaCacheError {
    fn from(err: serde_json::Error) -> Self {
        MediaCacheError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for MediaCacheError {
    fn from(err: rusqlite::Error) -> Self {
        MediaCacheError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for MediaCacheError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MediaCacheError::Timeout(std::time::Duration::from_secs(0))
        } else {
            MediaCacheError::Network {
                message: err.to_string(),
                cause: std::error::Error::source(&err).map(|s| s.to_string()),
            }
        }
    }
}

impl MediaCacheError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        MediaCacheError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Unwrap a shared failure to the error it carries.
    pub fn root(&self) -> &MediaCacheError {
        match self {
            MediaCacheError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        MediaCacheError::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Short label used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            MediaCacheError::Network { .. } => "network",
            MediaCacheError::Timeout(_) => "timeout",
            MediaCacheError::DownloadFailed { .. } => "download",
            MediaCacheError::Cancelled => "cancelled",
            MediaCacheError::Database { .. } => "database",
            MediaCacheError::Io { .. } | MediaCacheError::FileNotFound(_) => "filesystem",
            MediaCacheError::Json { .. } => "json",
            MediaCacheError::InvalidArgument { .. } => "invalid_argument",
            MediaCacheError::Leased { .. } => "leased",
            MediaCacheError::Config { .. } => "config",
            MediaCacheError::Shared(inner) => inner.kind(),
            MediaCacheError::Other(_) => "other",
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Network/connectivity error
    /// - -32003: Download failed
    /// - -32004: Cancelled
    /// - -32006: Entry in use
    /// - -32602: Invalid params
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            MediaCacheError::Network { .. } | MediaCacheError::Timeout(_) => -32000,
            MediaCacheError::DownloadFailed { .. } => -32003,
            MediaCacheError::Cancelled => -32004,
            MediaCacheError::Leased { .. } => -32006,
            MediaCacheError::InvalidArgument { .. } => -32602,
            MediaCacheError::Shared(inner) => inner.to_rpc_error_code(),
            _ => -32603,
        }
    }

    /// Check if this error is transient, so a later caller-driven retry may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MediaCacheError::Network { .. } | MediaCacheError::Timeout(_) => true,
            MediaCacheError::DownloadFailed {
                status: Some(status),
                ..
            } => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            MediaCacheError::DownloadFailed { status: None, .. } => true,
            MediaCacheError::Shared(inner) => inner.is_retryable(),
            _ => false,
        }
    }
}
