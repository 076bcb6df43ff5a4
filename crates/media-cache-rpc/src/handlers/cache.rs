//! Lookup, download and registration handlers.

use super::{get_bool_param, get_str_param, require_str_param, DispatchResult};
use crate::server::AppState;
use media_cache_core::{CancellationToken, EntryKind, MediaCacheError};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

fn path_value(path: Option<PathBuf>) -> Value {
    match path {
        Some(path) => json!(path.to_string_lossy()),
        None => Value::Null,
    }
}

pub async fn get_or_download(state: &AppState, params: &Value) -> DispatchResult {
    let reference = require_str_param(params, "reference", "reference")?;
    let credential = get_str_param(params, "credential", "credential").unwrap_or("");
    let display_name = get_str_param(params, "display_name", "displayName");
    let thumbnail = get_bool_param(params, "thumbnail", "thumbnail").unwrap_or(false);

    // The HTTP request owns this wait; a dropped connection drops the future.
    let cancel = CancellationToken::new();
    let path = state
        .cache
        .get_or_download(credential, &reference, display_name, thumbnail, &cancel)
        .await?;
    Ok(path_value(path))
}

pub async fn try_get_cached_path(state: &AppState, params: &Value) -> DispatchResult {
    let reference = require_str_param(params, "reference", "reference")?;
    let thumbnail = get_bool_param(params, "thumbnail", "thumbnail").unwrap_or(false);
    let path = state.cache.try_get_cached_path(&reference, thumbnail).await?;
    Ok(path_value(path))
}

pub async fn register_local_file(state: &AppState, params: &Value) -> DispatchResult {
    let path = require_str_param(params, "path", "path")?;
    let kind = match get_str_param(params, "kind", "kind") {
        Some(kind) => EntryKind::from_str(kind).ok_or_else(|| {
            MediaCacheError::invalid_argument("kind", format!("unknown entry kind: {}", kind))
        })?,
        None => EntryKind::UserLocal,
    };

    match state.cache.register_local_file(Path::new(&path), kind).await? {
        Some(registered) => Ok(serde_json::to_value(registered)?),
        None => Ok(Value::Null),
    }
}

pub async fn list_entries(state: &AppState, _params: &Value) -> DispatchResult {
    let entries = state.cache.list_entries().await;
    Ok(serde_json::to_value(entries)?)
}

pub async fn total_bytes(state: &AppState, _params: &Value) -> DispatchResult {
    Ok(json!(state.cache.total_bytes().await))
}
