//! Operator endpoints for inspecting and steering consolidation buffers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;

/// GET /buffers: keys with buffered state.
pub async fn list_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let keys = state.pipeline.active_keys();
    Json(json!({ "count": keys.len(), "keys": keys }))
}

/// GET /buffers/{key}
pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Json<Value> {
    let status = state.pipeline.buffer_status(&key);
    Json(json!({
        "key": key,
        "buffer_size": status.buffer_size,
        "has_active_timer": status.has_active_timer,
        "is_flushing": status.is_flushing,
    }))
}

/// POST /buffers/{key}/flush: process pending messages now.
pub async fn flush_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.pipeline.force_flush(&key).await {
        Ok(outcome) => {
            info!(key = %key, ?outcome, "forced flush via admin endpoint");
            let mut body = serde_json::to_value(outcome).unwrap_or_default();
            body["key"] = json!(key);
            Ok(Json(body))
        }
        Err(e) => {
            warn!(key = %key, error = %e, "forced flush failed");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({ "key": key, "error": e.to_string() })),
            ))
        }
    }
}

/// DELETE /buffers/{key}: drop pending messages unprocessed.
pub async fn clear_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Json<Value> {
    let discarded = state.pipeline.clear_buffer(&key);
    Json(json!({ "key": key, "discarded": discarded }))
}
