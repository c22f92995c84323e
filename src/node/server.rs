//! REST surface of the node runtime contract
//!
//! Mounts a `NodeRuntime` behind the canonical routes:
//! - `GET  /info` | `/status` | `/state` | `/log`
//! - `POST /config`
//! - `POST /admin/{command}`
//! - `POST /action/{name}` → create
//! - `POST /action/{name}/{action_id}/upload/{arg}` → multipart upload
//! - `POST /action/{name}/{action_id}/start`
//! - `GET  /action/{id}/status` | `/action/{id}/result` | `/action`
//! - `GET  /action/{name}/{id}/download/{label}`

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use super::registry::NodeRuntime;
use crate::types::{ActionStatus, AdminCommand};

/// Build the node's axum router.
pub fn router(runtime: Arc<NodeRuntime>) -> Router {
    Router::new()
        .route("/info", get(info_handler))
        .route("/status", get(status_handler))
        .route("/state", get(state_handler))
        .route("/log", get(log_handler))
        .route("/config", post(set_config_handler))
        .route("/admin/:command", post(admin_handler))
        .route("/action", get(history_handler))
        .route("/action/:name", post(create_action_handler))
        .route(
            "/action/:name/:action_id/upload/:arg",
            post(upload_handler),
        )
        .route("/action/:name/:action_id/start", post(start_handler))
        .route("/action/:action_id/status", get(action_status_handler))
        .route("/action/:action_id/result", get(action_result_handler))
        .route(
            "/action/:name/:action_id/download/:label",
            get(download_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

async fn info_handler(State(runtime): State<Arc<NodeRuntime>>) -> impl IntoResponse {
    Json(runtime.get_info().await)
}

async fn status_handler(State(runtime): State<Arc<NodeRuntime>>) -> impl IntoResponse {
    Json(runtime.get_status().await)
}

async fn state_handler(State(runtime): State<Arc<NodeRuntime>>) -> impl IntoResponse {
    Json(runtime.get_state().await)
}

async fn log_handler(State(runtime): State<Arc<NodeRuntime>>) -> impl IntoResponse {
    Json(runtime.get_log().await)
}

async fn set_config_handler(
    State(runtime): State<Arc<NodeRuntime>>,
    Json(new_config): Json<HashMap<String, Value>>,
) -> impl IntoResponse {
    Json(runtime.set_config(new_config).await)
}

/// POST /admin/{command}
///
/// Unsupported commands answer 501; unknown command names 400.
async fn admin_handler(
    State(runtime): State<Arc<NodeRuntime>>,
    Path(command): Path<String>,
) -> impl IntoResponse {
    let command: AdminCommand = match command.parse() {
        Ok(cmd) => cmd,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e })));
        }
    };
    let response = runtime.run_admin_command(command).await;
    let code = if response.success {
        StatusCode::OK
    } else {
        StatusCode::NOT_IMPLEMENTED
    };
    (code, Json(serde_json::to_value(response).unwrap_or(Value::Null)))
}

/// POST /action/{name}
///
/// Phase 1: validate and record. Validation failures answer 422 with the
/// failed `ActionResult` so the caller sees the typed reason.
async fn create_action_handler(
    State(runtime): State<Arc<NodeRuntime>>,
    Path(name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(args): Json<HashMap<String, Value>>,
) -> impl IntoResponse {
    let provided_id = query.get("action_id").cloned();
    match runtime.create_action(&name, args, provided_id).await {
        Ok(action_id) => (StatusCode::OK, Json(json!({ "action_id": action_id }))),
        Err(result) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::to_value(result).unwrap_or(Value::Null)),
        ),
    }
}

/// POST /action/{name}/{action_id}/upload/{arg}
async fn upload_handler(
    State(runtime): State<Arc<NodeRuntime>>,
    Path((_name, action_id, arg)): Path<(String, String, String)>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    while let Ok(Some(field)) = multipart.next_field().await {
        let file_name = field
            .file_name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| arg.clone());
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("failed to read upload: {}", e) })),
                );
            }
        };
        match runtime
            .upload_action_file(&action_id, &arg, &bytes, &file_name)
            .await
        {
            Ok(path) => {
                return (
                    StatusCode::OK,
                    Json(json!({ "staged": path.to_string_lossy() })),
                );
            }
            Err(e) => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": e.to_string() })),
                );
            }
        }
    }
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "no file in upload request" })),
    )
}

/// POST /action/{name}/{action_id}/start
///
/// Blocks until the handler completes. The result carries failure inline;
/// only an unknown action id is an HTTP error.
async fn start_handler(
    State(runtime): State<Arc<NodeRuntime>>,
    Path((_name, action_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let known = runtime.get_action_result(&action_id).await.is_some();
    if !known {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no action {}", action_id) })),
        );
    }
    let result = runtime.start_action(&action_id).await;
    (
        StatusCode::OK,
        Json(serde_json::to_value(result).unwrap_or(Value::Null)),
    )
}

async fn action_status_handler(
    State(runtime): State<Arc<NodeRuntime>>,
    Path(action_id): Path<String>,
) -> impl IntoResponse {
    match runtime.get_action_status(&action_id).await {
        Some(status) => (StatusCode::OK, Json(json!(status))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no action {}", action_id) })),
        ),
    }
}

async fn action_result_handler(
    State(runtime): State<Arc<NodeRuntime>>,
    Path(action_id): Path<String>,
) -> impl IntoResponse {
    match runtime.get_action_result(&action_id).await {
        Some(result) => (
            StatusCode::OK,
            Json(serde_json::to_value(result).unwrap_or(Value::Null)),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no action {}", action_id) })),
        ),
    }
}

async fn history_handler(State(runtime): State<Arc<NodeRuntime>>) -> impl IntoResponse {
    Json(runtime.action_history().await)
}

/// GET /action/{name}/{action_id}/download/{label}
///
/// Streams back a file result produced by a finished action.
async fn download_handler(
    State(runtime): State<Arc<NodeRuntime>>,
    Path((_name, action_id, label)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let Some(result) = runtime.get_action_result(&action_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no action {}", action_id) })),
        )
            .into_response();
    };
    if result.status != ActionStatus::Succeeded && result.files.is_empty() {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "action has no file results" })),
        )
            .into_response();
    }
    let Some(path) = result.files.get(&label) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no file result labeled {}", label) })),
        )
            .into_response();
    };
    match tokio::fs::read(path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("failed to read file result: {}", e) })),
        )
            .into_response(),
    }
}
