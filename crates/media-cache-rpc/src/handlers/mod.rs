//! JSON-RPC request handlers, split by domain.

mod cache;
mod maintenance;

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use media_cache_core::MediaCacheError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// JSON-RPC code for an unknown method.
const METHOD_NOT_FOUND: i32 = -32601;

// ============================================================================
// JSON-RPC types
// ============================================================================

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Always present on success, `null` for a cache miss.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

/// A failed dispatch, already mapped to a JSON-RPC code.
#[derive(Debug)]
pub(crate) struct DispatchError {
    code: i32,
    message: String,
}

impl From<MediaCacheError> for DispatchError {
    fn from(err: MediaCacheError) -> Self {
        Self {
            code: err.to_rpc_error_code(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        MediaCacheError::from(err).into()
    }
}

pub(crate) type DispatchResult = std::result::Result<Value, DispatchError>;

// ============================================================================
// Parameter extraction helpers
// ============================================================================

/// Extract an optional string parameter, supporting both snake_case and camelCase.
pub(crate) fn get_str_param<'a>(params: &'a Value, snake: &str, camel: &str) -> Option<&'a str> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_str())
}

/// Extract a required string parameter or return an error.
pub(crate) fn require_str_param(
    params: &Value,
    snake: &str,
    camel: &str,
) -> media_cache_core::Result<String> {
    get_str_param(params, snake, camel)
        .map(String::from)
        .ok_or_else(|| MediaCacheError::invalid_argument(snake, "missing required parameter"))
}

/// Extract an optional bool parameter, supporting both snake_case and camelCase.
pub(crate) fn get_bool_param(params: &Value, snake: &str, camel: &str) -> Option<bool> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_bool())
}

// ============================================================================
// HTTP endpoints
// ============================================================================

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let method = &request.method;
    let params = request.params.unwrap_or(Value::Object(Default::default()));
    let id = request.id.clone();

    debug!("RPC call: {}", method);

    if method == "health_check" {
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::success(id, json!({"status": "ok"}))),
        );
    }

    match dispatch_method(&state, method, &params).await {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            if e.code == METHOD_NOT_FOUND {
                warn!("Method not found: {}", method);
            } else {
                error!("RPC error for {}: {}", method, e.message);
            }
            (
                StatusCode::OK,
                Json(JsonRpcResponse::error(id, e.code, e.message)),
            )
        }
    }
}

// ============================================================================
// Method dispatcher
// ============================================================================

/// Dispatch a method call to the appropriate domain handler.
async fn dispatch_method(state: &AppState, method: &str, params: &Value) -> DispatchResult {
    match method {
        // Lookup & Download
        "get_or_download" => cache::get_or_download(state, params).await,
        "try_get_cached_path" => cache::try_get_cached_path(state, params).await,
        "register_local_file" => cache::register_local_file(state, params).await,
        "list_entries" => cache::list_entries(state, params).await,
        "total_bytes" => cache::total_bytes(state, params).await,

        // Maintenance
        "remove_entry" => maintenance::remove_entry(state, params).await,
        "get_stats" => maintenance::get_stats(state, params).await,
        "sweep" => maintenance::sweep(state, params).await,
        "reconcile" => maintenance::reconcile(state, params).await,
        "clear" => maintenance::clear(state, params).await,

        // Unknown method
        _ => Err(DispatchError {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {}", method),
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use media_cache_core::MediaCache;
    use tempfile::TempDir;

    async fn state(root: &std::path::Path) -> AppState {
        let cache = MediaCache::builder(root)
            .remote_base_url("http://127.0.0.1:9/")
            .build()
            .await
            .unwrap();
        AppState { cache }
    }

    #[test]
    fn test_json_rpc_response_success() {
        let response = JsonRpcResponse::success(Some(json!(1)), json!({"data": "test"}));
        assert!(response.error.is_none());
        assert_eq!(response.jsonrpc, "2.0");
    }

    #[test]
    fn test_json_rpc_response_error() {
        let response = JsonRpcResponse::error(Some(json!(1)), -32602, "bad".into());
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("result").is_none());
        assert_eq!(value["error"]["code"], -32602);
    }

    #[test]
    fn test_params_accept_both_cases() {
        let snake = json!({"display_name": "a.jpg"});
        let camel = json!({"displayName": "b.jpg"});
        assert_eq!(get_str_param(&snake, "display_name", "displayName"), Some("a.jpg"));
        assert_eq!(get_str_param(&camel, "display_name", "displayName"), Some("b.jpg"));
        assert_eq!(get_bool_param(&json!({"thumbnail": true}), "thumbnail", "thumbnail"), Some(true));
    }

    #[test]
    fn test_missing_required_param_is_invalid_params() {
        let err: DispatchError = require_str_param(&json!({}), "reference", "reference")
            .unwrap_err()
            .into();
        assert_eq!(err.code, -32602);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let temp_dir = TempDir::new().unwrap();
        let state = state(temp_dir.path()).await;
        let err = dispatch_method(&state, "no_such_method", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_miss_is_null_result() {
        let temp_dir = TempDir::new().unwrap();
        let state = state(temp_dir.path()).await;
        let value = dispatch_method(
            &state,
            "try_get_cached_path",
            &json!({"reference": "x/y.jpg", "thumbnail": true}),
        )
        .await
        .unwrap();
        assert!(value.is_null());
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let picked = TempDir::new().unwrap();
        let state = state(temp_dir.path()).await;
        let file = picked.path().join("photo.png");
        std::fs::write(&file, b"png bytes").unwrap();

        let registered = dispatch_method(
            &state,
            "register_local_file",
            &json!({"path": file.to_str().unwrap(), "kind": "user_local"}),
        )
        .await
        .unwrap();
        assert!(registered["canonicalKey"].as_str().unwrap().starts_with("full:local/"));

        let entries = dispatch_method(&state, "list_entries", &json!({})).await.unwrap();
        assert_eq!(entries.as_array().unwrap().len(), 1);
        let total = dispatch_method(&state, "total_bytes", &json!({})).await.unwrap();
        assert_eq!(total, json!(9));
    }
}
