//! Metadata persistence helpers.
//!
//! Crash-safe JSON snapshots shared by the JSON metadata backend and the
//! configuration loader.

mod atomic;

pub use atomic::{
    atomic_read_json, atomic_write_json, backup_path_for, promote_staged, remove_stale_staged,
    stage_json, STAGED_SUFFIX,
};
