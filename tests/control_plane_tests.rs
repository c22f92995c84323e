//! Control plane end-to-end: a live manager driving a live node over HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use workcelld::config::{AppState, Config};
use workcelld::engine::node_poll_loop;
use workcelld::handlers;
use workcelld::node::registry::{action_handler, NodeRuntime};
use workcelld::node::server;
use workcelld::types::{ActionDefinition, ActionResult, ArgumentDefinition, FileArgumentDefinition};

fn test_config(file_dir: std::path::PathBuf) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        workcell_name: "e2e".to_string(),
        state_path: None,
        data_url: None,
        file_dir,
        tick_ms: 50,
        node_poll_ms: 50,
        step_timeout_s: 5,
        client_max_attempts: 1,
        retention_s: 300,
        strict_nodes: false,
        seed_nodes: HashMap::new(),
    }
}

/// Boot a node, the manager, and both background loops. Returns the
/// manager's base url.
async fn boot() -> (String, tempfile::TempDir) {
    let staging = tempfile::tempdir().unwrap();

    // The instrument node.
    let runtime = Arc::new(
        NodeRuntime::new("echo_node", "echo_module")
            .with_upload_dir(staging.path().join("node-uploads")),
    );
    runtime
        .register_action(
            ActionDefinition::new("echo")
                .with_arg(ArgumentDefinition::required("message", "string")),
            action_handler(|ctx| async move {
                let message = ctx.args["message"].clone();
                Ok(ActionResult::succeeded(ctx.action_id).with_data("echoed", message))
            }),
        )
        .await;
    runtime
        .register_action(
            ActionDefinition::new("analyze")
                .with_file(FileArgumentDefinition::required("recipe")),
            action_handler(|ctx| async move {
                let path = ctx.files.get("recipe").cloned().unwrap_or_default();
                let content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
                Ok(ActionResult::succeeded(ctx.action_id)
                    .with_data("recipe_len", json!(content.len())))
            }),
        )
        .await;
    let node_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let node_url = format!("http://{}", node_listener.local_addr().unwrap());
    let node_app = server::router(runtime);
    tokio::spawn(async move {
        axum::serve(node_listener, node_app).await.ok();
    });

    // The workcell manager.
    let state = AppState::new(test_config(staging.path().join("manager")))
        .await
        .unwrap();
    let engine = state.engine.clone();
    tokio::spawn(async move {
        engine.run_loop(Duration::from_millis(50)).await;
    });
    tokio::spawn(node_poll_loop(
        state.state.clone(),
        state.clients.clone(),
        Duration::from_millis(50),
    ));

    let manager_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let manager_url = format!("http://{}", manager_listener.local_addr().unwrap());
    let app = handlers::router(state);
    tokio::spawn(async move {
        axum::serve(manager_listener, app).await.ok();
    });

    // Register the node and wait until the poller sees it ready.
    let http = reqwest::Client::new();
    http.post(format!("{}/node", manager_url))
        .json(&json!({ "node_name": "echo_node", "node_url": node_url }))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    for _ in 0..100 {
        let node: Value = http
            .get(format!("{}/node/echo_node", manager_url))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if node["status"]["ready"] == json!(true) {
            return (manager_url, staging);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("node never became ready");
}

async fn poll_workflow(http: &reqwest::Client, base: &str, id: &str) -> Value {
    for _ in 0..150 {
        let workflow: Value = http
            .get(format!("{}/workflow/{}", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let status = &workflow["status"];
        if status["completed"] == json!(true)
            || status["failed"] == json!(true)
            || status["cancelled"] == json!(true)
        {
            return workflow;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("workflow {} never finished", id);
}

#[tokio::test]
async fn submit_and_complete_workflow_over_http() {
    let (base, _staging) = boot().await;
    let http = reqwest::Client::new();

    // Store a definition with a required JSON input.
    let definition = json!({
        "name": "Echo Run",
        "parameters": {
            "json_inputs": [{ "key": "message", "required": true }]
        },
        "steps": [{
            "name": "Echo",
            "node": "echo_node",
            "action": "echo",
            "use_parameters": { "args": { "message": "message" } }
        }]
    });
    let stored: Value = http
        .post(format!("{}/workflow_definition", base))
        .json(&definition)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let definition_id = stored["workflow_definition_id"].as_str().unwrap().to_string();

    // Submission without the required input is rejected outright.
    let bad = reqwest::multipart::Form::new().text(
        "data",
        json!({ "workflow_definition_id": definition_id }).to_string(),
    );
    let response = http
        .post(format!("{}/workflow", base))
        .multipart(bad)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], json!("Required value message not provided"));

    // A valid submission runs to completion.
    let good = reqwest::multipart::Form::new().text(
        "data",
        json!({
            "workflow_definition_id": definition_id,
            "parameter_values": { "message": "hello workcell" }
        })
        .to_string(),
    );
    let response = http
        .post(format!("{}/workflow", base))
        .multipart(good)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let workflow: Value = response.json().await.unwrap();
    let workflow_id = workflow["workflow_id"].as_str().unwrap().to_string();
    assert_eq!(workflow["status"]["queued"], json!(true));

    let done = poll_workflow(&http, &base, &workflow_id).await;
    assert_eq!(done["status"]["completed"], json!(true));
    assert_eq!(
        done["steps"][0]["result"]["data"]["echoed"],
        json!("hello workcell")
    );
    assert!(done["end_time"].is_string());
}

#[tokio::test]
async fn file_inputs_flow_to_the_node() {
    let (base, _staging) = boot().await;
    let http = reqwest::Client::new();

    let definition = json!({
        "name": "Analyze Run",
        "parameters": {
            "file_inputs": [{ "key": "recipe", "required": true }]
        },
        "steps": [{
            "name": "Analyze",
            "node": "echo_node",
            "action": "analyze",
            "use_parameters": { "files": { "recipe": "recipe" } }
        }]
    });

    let form = reqwest::multipart::Form::new()
        .text(
            "data",
            json!({ "definition": definition, "parameter_values": {} }).to_string(),
        )
        .part(
            "recipe",
            reqwest::multipart::Part::bytes(b"mix 1:10 and incubate".to_vec())
                .file_name("recipe.txt"),
        );
    let response = http
        .post(format!("{}/workflow", base))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let workflow: Value = response.json().await.unwrap();
    let workflow_id = workflow["workflow_id"].as_str().unwrap().to_string();
    assert!(workflow["file_input_ids"]["recipe"].is_string());

    let done = poll_workflow(&http, &base, &workflow_id).await;
    assert_eq!(done["status"]["completed"], json!(true));
    assert_eq!(
        done["steps"][0]["result"]["data"]["recipe_len"],
        json!("mix 1:10 and incubate".len())
    );
}

#[tokio::test]
async fn control_endpoints_answer_404_for_unknown_ids() {
    let (base, _staging) = boot().await;
    let http = reqwest::Client::new();

    for path in ["workflow/nope", "workflow_definition/nope", "node/nope"] {
        let response = http.get(format!("{}/{}", base, path)).send().await.unwrap();
        assert_eq!(response.status(), 404, "GET {}", path);
    }
    let response = http
        .post(format!("{}/workflow/nope/cancel", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn composed_state_and_health() {
    let (base, _staging) = boot().await;
    let http = reqwest::Client::new();

    let health: Value = http
        .get(format!("{}/healthz", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], json!("ok"));

    let state: Value = http
        .get(format!("{}/state", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(state["nodes"]["echo_node"].is_object());
    assert!(state["workflows"].is_object());
    assert!(state["locations"].is_array());

    // Admin passthrough reaches the node.
    let response = http
        .post(format!("{}/node/echo_node/admin/pause", base))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    http.post(format!("{}/node/echo_node/admin/resume", base))
        .send()
        .await
        .unwrap();
}
