//! Removal, eviction and housekeeping handlers.

use super::{get_bool_param, require_str_param, DispatchResult};
use crate::server::AppState;
use serde_json::{json, Value};

pub async fn remove_entry(state: &AppState, params: &Value) -> DispatchResult {
    let reference = require_str_param(params, "reference", "reference")?;
    let thumbnail = get_bool_param(params, "thumbnail", "thumbnail").unwrap_or(false);
    let removed = state.cache.remove(&reference, thumbnail).await?;
    Ok(json!({ "removed": removed }))
}

pub async fn get_stats(state: &AppState, _params: &Value) -> DispatchResult {
    let stats = state.cache.stats().await;
    let mut value = serde_json::to_value(&stats)?;
    value["hitRatio"] = json!(stats.hit_ratio());
    value["inFlight"] = json!(state.cache.in_flight_downloads());
    Ok(value)
}

pub async fn sweep(state: &AppState, _params: &Value) -> DispatchResult {
    Ok(serde_json::to_value(state.cache.sweep().await)?)
}

pub async fn reconcile(state: &AppState, _params: &Value) -> DispatchResult {
    Ok(serde_json::to_value(state.cache.reconcile().await)?)
}

pub async fn clear(state: &AppState, _params: &Value) -> DispatchResult {
    let removed = state.cache.clear().await;
    Ok(json!({ "removed": removed }))
}
