//! HTTP control plane
//!
//! Implements the workcell manager endpoints:
//! - `POST /workflow_definition`, `GET /workflow_definition/{id}`, `GET /definitions`
//! - `POST /workflow` (multipart JSON `data` + files), `GET /workflow/{id}`
//! - `POST /workflow/{id}/pause | /resume | /cancel | /retry?index=i`
//! - `GET  /workflows/active | /archived?number=N | /queue`
//! - `GET|POST /node`, `GET /nodes`, `GET /node/{name}`, admin passthrough
//! - `GET  /state`, locations CRUD, `GET /healthz`
//!
//! Reads are lock-free snapshots; writes go through the state handler's
//! per-entity locks.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;

use crate::config::AppState;
use crate::error::ValidationError;
use crate::params::{bind_inputs, validate_inputs};
use crate::types::{AdminCommand, Location, Node, Ownership};
use crate::workflow::{Workflow, WorkflowDefinition};

// ═══════════════════════════════════════════════════════════════════════════
// Router
// ═══════════════════════════════════════════════════════════════════════════

/// Assemble the control-plane router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Workflow definitions
        .route("/workflow_definition", post(store_definition_handler))
        .route("/workflow_definition/:id", get(get_definition_handler))
        .route("/definitions", get(list_definitions_handler))
        // Workflow lifecycle
        .route("/workflow", post(submit_workflow_handler))
        .route("/workflow/:id", get(get_workflow_handler))
        .route("/workflow/:id/pause", post(pause_workflow_handler))
        .route("/workflow/:id/resume", post(resume_workflow_handler))
        .route("/workflow/:id/cancel", post(cancel_workflow_handler))
        .route("/workflow/:id/retry", post(retry_workflow_handler))
        // List views
        .route("/workflows/active", get(active_workflows_handler))
        .route("/workflows/archived", get(archived_workflows_handler))
        .route("/workflows/queue", get(workflow_queue_handler))
        // Node registry
        .route("/node", get(list_nodes_handler).post(add_node_handler))
        .route("/nodes", get(list_nodes_handler))
        .route("/node/:name", get(get_node_handler))
        .route("/node/:name/admin/:command", post(node_admin_handler))
        // Composed state & locations
        .route("/state", get(workcell_state_handler))
        .route("/locations", get(list_locations_handler))
        .route("/location", post(add_location_handler))
        .route(
            "/location/:id/attach_resource",
            post(attach_resource_handler),
        )
        .route("/location/:id", delete(delete_location_handler))
        // Health check
        .route("/healthz", get(health_handler))
        .with_state(state)
}

// ═══════════════════════════════════════════════════════════════════════════
// Workflow Definitions
// ═══════════════════════════════════════════════════════════════════════════

/// POST /workflow_definition
pub async fn store_definition_handler(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> impl IntoResponse {
    match state.state.store_definition(definition).await {
        Ok(id) => (
            StatusCode::CREATED,
            Json(json!({ "workflow_definition_id": id })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// GET /workflow_definition/:id
pub async fn get_definition_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.state.get_definition(&id).await {
        Some(definition) => (
            StatusCode::OK,
            Json(serde_json::to_value(definition).unwrap_or(Value::Null)),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no definition {}", id) })),
        ),
    }
}

/// GET /definitions
pub async fn list_definitions_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.state.definition_ids().await)
}

// ═══════════════════════════════════════════════════════════════════════════
// Workflow Submission
// ═══════════════════════════════════════════════════════════════════════════

/// The JSON `data` part of a multipart workflow submission.
#[derive(Debug, Deserialize)]
pub struct WorkflowSubmission {
    #[serde(default)]
    pub workflow_definition_id: Option<String>,
    /// Inline definition, as an alternative to a stored id.
    #[serde(default)]
    pub definition: Option<WorkflowDefinition>,
    #[serde(default)]
    pub parameter_values: HashMap<String, Value>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub ownership: Ownership,
}

/// POST /workflow (multipart: `data` JSON + one part per file input)
pub async fn submit_workflow_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut submission: Option<WorkflowSubmission> = None;
    let mut files: Vec<(String, String, Vec<u8>)> = Vec::new();

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.name().unwrap_or_default().to_string();
                if name == "data" {
                    let text = match field.text().await {
                        Ok(text) => text,
                        Err(e) => {
                            return (
                                StatusCode::BAD_REQUEST,
                                Json(json!({ "error": format!("bad data part: {}", e) })),
                            );
                        }
                    };
                    match serde_json::from_str(&text) {
                        Ok(parsed) => submission = Some(parsed),
                        Err(e) => {
                            return (
                                StatusCode::BAD_REQUEST,
                                Json(json!({ "error": format!("bad data part: {}", e) })),
                            );
                        }
                    }
                } else {
                    let file_name = field
                        .file_name()
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| name.clone());
                    match field.bytes().await {
                        Ok(bytes) => files.push((name, file_name, bytes.to_vec())),
                        Err(e) => {
                            return (
                                StatusCode::BAD_REQUEST,
                                Json(json!({ "error": format!("bad file part: {}", e) })),
                            );
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("bad multipart request: {}", e) })),
                );
            }
        }
    }

    let Some(submission) = submission else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing data part" })),
        );
    };

    match materialize_workflow(&state, submission, files).await {
        Ok(workflow) => (
            StatusCode::CREATED,
            Json(serde_json::to_value(workflow).unwrap_or(Value::Null)),
        ),
        Err(SubmitError::Validation(e)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": e.to_string() })),
        ),
        Err(SubmitError::NotFound(id)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no definition {}", id) })),
        ),
        Err(SubmitError::Internal(msg)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": msg })),
        ),
    }
}

enum SubmitError {
    Validation(ValidationError),
    NotFound(String),
    Internal(String),
}

impl From<ValidationError> for SubmitError {
    fn from(e: ValidationError) -> Self {
        SubmitError::Validation(e)
    }
}

/// Materialize a workflow from a submission: resolve the definition, run
/// submission-time parameter resolution, stage files, and enqueue.
async fn materialize_workflow(
    state: &AppState,
    submission: WorkflowSubmission,
    files: Vec<(String, String, Vec<u8>)>,
) -> Result<Workflow, SubmitError> {
    let definition = match (&submission.workflow_definition_id, submission.definition) {
        (Some(id), _) => state
            .state
            .get_definition(id)
            .await
            .ok_or_else(|| SubmitError::NotFound(id.clone()))?,
        (None, Some(inline)) => inline,
        (None, None) => {
            return Err(ValidationError::Invalid(
                "submission carries neither workflow_definition_id nor definition".to_string(),
            )
            .into());
        }
    };

    let file_keys: Vec<String> = files.iter().map(|(key, _, _)| key.clone()).collect();
    let step_keys: Vec<Option<String>> = definition.steps.iter().map(|s| s.key.clone()).collect();
    validate_inputs(
        &definition.parameters,
        &submission.parameter_values,
        &file_keys,
        definition.steps.len(),
        &step_keys,
    )?;

    if state.config.strict_nodes {
        let nodes = state.state.nodes().await;
        for step in &definition.steps {
            let templated = step
                .use_parameters
                .as_ref()
                .map(|p| p.node.is_some())
                .unwrap_or(false);
            if !templated && !nodes.contains_key(&step.node) {
                return Err(ValidationError::UnknownNode {
                    step: step.name.clone(),
                    node: step.node.clone(),
                }
                .into());
            }
        }
    }

    let mut workflow = Workflow::from_definition(&definition, submission.ownership);
    workflow.scheduler_metadata.priority = submission.priority;

    // Stage each uploaded file as a datapoint before binding.
    let mut file_ids: HashMap<String, String> = HashMap::new();
    for (key, file_name, bytes) in files {
        let id = state
            .data
            .stage_file(&key, &file_name, &bytes, workflow.ownership.clone())
            .await
            .map_err(|e| SubmitError::Internal(e.to_string()))?;
        file_ids.insert(key, id);
    }

    bind_inputs(&mut workflow, submission.parameter_values, file_ids);

    workflow.status.initializing = false;
    workflow.status.queued = true;
    workflow.submitted_time = Some(chrono::Utc::now());

    state
        .state
        .set_active_workflow(workflow.clone())
        .await
        .map_err(|e| SubmitError::Internal(e.to_string()))?;
    state
        .state
        .enqueue_workflow(&workflow.workflow_id)
        .await
        .map_err(|e| SubmitError::Internal(e.to_string()))?;

    info!(
        workflow_id = %workflow.workflow_id,
        name = %workflow.name,
        "Workflow submitted"
    );
    Ok(workflow)
}

// ═══════════════════════════════════════════════════════════════════════════
// Workflow Queries & Control
// ═══════════════════════════════════════════════════════════════════════════

/// GET /workflow/:id
pub async fn get_workflow_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.state.get_workflow_anywhere(&id).await {
        Some(workflow) => (
            StatusCode::OK,
            Json(serde_json::to_value(workflow).unwrap_or(Value::Null)),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no workflow {}", id) })),
        ),
    }
}

/// POST /workflow/:id/pause
pub async fn pause_workflow_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.pause_workflow(&id).await {
        Ok(workflow) => (
            StatusCode::OK,
            Json(serde_json::to_value(workflow).unwrap_or(Value::Null)),
        ),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// POST /workflow/:id/resume
pub async fn resume_workflow_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.resume_workflow(&id).await {
        Ok(workflow) => (
            StatusCode::OK,
            Json(serde_json::to_value(workflow).unwrap_or(Value::Null)),
        ),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// POST /workflow/:id/cancel
pub async fn cancel_workflow_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.cancel_workflow(&id).await {
        Ok(workflow) => (
            StatusCode::OK,
            Json(serde_json::to_value(workflow).unwrap_or(Value::Null)),
        ),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct RetryQuery {
    #[serde(default)]
    pub index: Option<usize>,
}

/// POST /workflow/:id/retry?index=i
///
/// Defaults to retrying from the step the workflow stopped on.
pub async fn retry_workflow_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RetryQuery>,
) -> impl IntoResponse {
    let index = match query.index {
        Some(index) => index,
        None => match state.state.get_workflow(&id).await {
            Some(workflow) => workflow.status.current_step_index,
            None => {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": format!("no workflow {}", id) })),
                );
            }
        },
    };
    match state.engine.retry_workflow(&id, index).await {
        Ok(workflow) => (
            StatusCode::OK,
            Json(serde_json::to_value(workflow).unwrap_or(Value::Null)),
        ),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// GET /workflows/active
pub async fn active_workflows_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.state.active_workflows().await)
}

#[derive(Debug, Deserialize)]
pub struct ArchiveQuery {
    #[serde(default = "default_archive_number")]
    pub number: usize,
}

fn default_archive_number() -> usize {
    20
}

/// GET /workflows/archived?number=N
pub async fn archived_workflows_handler(
    State(state): State<AppState>,
    Query(query): Query<ArchiveQuery>,
) -> impl IntoResponse {
    Json(state.state.archived_workflows(query.number).await)
}

/// GET /workflows/queue
pub async fn workflow_queue_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.state.workflow_queue().await)
}

// ═══════════════════════════════════════════════════════════════════════════
// Node Registry
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct AddNodeRequest {
    pub node_name: String,
    pub node_url: String,
}

/// POST /node
pub async fn add_node_handler(
    State(state): State<AppState>,
    Json(request): Json<AddNodeRequest>,
) -> impl IntoResponse {
    let node = Node::new(&request.node_url);
    match state.state.set_node(&request.node_name, node.clone()).await {
        Ok(()) => {
            info!(node = %request.node_name, url = %request.node_url, "Node registered");
            (
                StatusCode::CREATED,
                Json(serde_json::to_value(node).unwrap_or(Value::Null)),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// GET /nodes (and GET /node)
pub async fn list_nodes_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.state.nodes().await)
}

/// GET /node/:name
pub async fn get_node_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.state.get_node(&name).await {
        Some(node) => (
            StatusCode::OK,
            Json(serde_json::to_value(node).unwrap_or(Value::Null)),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no node {}", name) })),
        ),
    }
}

/// POST /node/:name/admin/:command — passthrough to the node.
pub async fn node_admin_handler(
    State(state): State<AppState>,
    Path((name, command)): Path<(String, String)>,
) -> impl IntoResponse {
    let command: AdminCommand = match command.parse() {
        Ok(cmd) => cmd,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e })));
        }
    };
    let Some(node) = state.state.get_node(&name).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no node {}", name) })),
        );
    };
    let client = match state.clients.client_for(&name, &node).await {
        Ok(client) => client,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            );
        }
    };
    match client.send_admin_command(command).await {
        Ok(response) => (
            StatusCode::OK,
            Json(serde_json::to_value(response).unwrap_or(Value::Null)),
        ),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Workcell State & Locations
// ═══════════════════════════════════════════════════════════════════════════

/// GET /state
pub async fn workcell_state_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.state.composed_state().await)
}

/// GET /locations
pub async fn list_locations_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.state.locations().await)
}

/// POST /location
pub async fn add_location_handler(
    State(state): State<AppState>,
    Json(location): Json<Location>,
) -> impl IntoResponse {
    match state.state.set_location(location.clone()).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::to_value(location).unwrap_or(Value::Null)),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct AttachResourceRequest {
    pub resource_id: String,
}

/// POST /location/:id/attach_resource
pub async fn attach_resource_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AttachResourceRequest>,
) -> impl IntoResponse {
    match state.state.attach_resource(&id, &request.resource_id).await {
        Ok(location) => (
            StatusCode::OK,
            Json(serde_json::to_value(location).unwrap_or(Value::Null)),
        ),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// DELETE /location/:id
pub async fn delete_location_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.state.delete_location(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "deleted": id }))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Health Check
// ═══════════════════════════════════════════════════════════════════════════

/// GET /healthz
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}
