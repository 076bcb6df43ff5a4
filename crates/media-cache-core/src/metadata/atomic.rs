//! Atomic file operations for safe JSON persistence.
//!
//! Implements atomic writes using:
//! 1. Write to temp file with a unique PID + counter suffix
//! 2. Flush and `sync_all` so the data reaches disk
//! 3. Optional backup of the previous version
//! 4. Atomic rename to target path, falling back to a copy-overwrite when the
//!    platform refuses the rename
//!
//! A crash at any point before step 4 leaves the previous file untouched.

use crate::error::{MediaCacheError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Suffix shared by every staged temp file, used to sweep leftovers at startup.
pub const STAGED_SUFFIX: &str = ".tmp";

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if parsing fails.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path).map_err(|e| MediaCacheError::Io {
        message: format!("Failed to open {}", path.display()),
        path: Some(path.to_path_buf()),
        source: Some(e),
    })?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| MediaCacheError::Io {
            message: format!("Failed to read {}", path.display()),
            path: Some(path.to_path_buf()),
            source: Some(e),
        })?;

    let data: T = serde_json::from_str(&contents).map_err(|e| MediaCacheError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Write data to a JSON file atomically.
///
/// Equivalent to [`stage_json`] followed by [`promote_staged`].
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T, keep_backup: bool) -> Result<()> {
    let staged = stage_json(path, data)?;
    promote_staged(&staged, path, keep_backup)
}

/// Serialize `data` into a durable temp file next to `path`.
///
/// The target itself is not touched. Returns the temp path to hand to
/// [`promote_staged`].
pub fn stage_json<T: Serialize>(path: &Path, data: &T) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| MediaCacheError::Io {
                message: format!("Failed to create directory {}", parent.display()),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }
    }

    let temp_path = staged_path_for(path);

    let serialized = serde_json::to_string_pretty(data).map_err(|e| MediaCacheError::Json {
        message: format!("Failed to serialize data: {}", e),
        source: Some(e),
    })?;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|e| MediaCacheError::Io {
            message: format!("Failed to create temp file {}", temp_path.display()),
            path: Some(temp_path.clone()),
            source: Some(e),
        })?;

    let written = file
        .write_all(serialized.as_bytes())
        .and_then(|_| file.flush())
        .and_then(|_| file.sync_all());

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(MediaCacheError::Io {
            message: format!("Failed to write temp file {}", temp_path.display()),
            path: Some(temp_path),
            source: Some(e),
        });
    }

    Ok(temp_path)
}

/// Promote a staged temp file to `path`.
///
/// Uses an atomic rename. If the rename fails the staged bytes are copied over
/// the target as a best-effort fallback, and the temp file is removed.
pub fn promote_staged(staged: &Path, path: &Path, keep_backup: bool) -> Result<()> {
    if keep_backup && path.exists() {
        let backup_path = backup_path_for(path);
        if let Err(e) = fs::copy(path, &backup_path) {
            warn!("Failed to create backup {}: {}", backup_path.display(), e);
        }
    }

    match fs::rename(staged, path) {
        Ok(()) => {
            debug!("Atomically wrote {}", path.display());
            Ok(())
        }
        Err(rename_err) => {
            warn!(
                "Atomic rename {} -> {} failed ({}), overwriting in place",
                staged.display(),
                path.display(),
                rename_err
            );
            let copied = fs::copy(staged, path);
            let _ = fs::remove_file(staged);
            copied.map(|_| ()).map_err(|e| MediaCacheError::Io {
                message: format!(
                    "Failed to promote {} to {}",
                    staged.display(),
                    path.display()
                ),
                path: Some(path.to_path_buf()),
                source: Some(e),
            })
        }
    }
}

/// Location of the backup copy kept by [`promote_staged`].
pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

/// Remove temp files left next to `path` by an interrupted write.
///
/// Returns how many were removed.
pub fn remove_stale_staged(path: &Path) -> usize {
    let (Some(parent), Some(stem)) = (path.parent(), path.file_name()) else {
        return 0;
    };
    let prefix = format!("{}.", stem.to_string_lossy());

    let Ok(entries) = fs::read_dir(parent) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name.ends_with(STAGED_SUFFIX) {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove stale temp file {}: {}", name, e),
            }
        }
    }
    removed
}

fn staged_path_for(path: &Path) -> PathBuf {
    let seq = STAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.{}{}", process::id(), seq, STAGED_SUFFIX));
    path.with_file_name(name)
}
