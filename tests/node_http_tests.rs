//! REST node contract end-to-end: RestNodeClient against a live node
//! server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use workcelld::node::client::{NodeClient, RestNodeClient};
use workcelld::node::registry::{action_handler, NodeRuntime};
use workcelld::node::server;
use workcelld::types::{
    ActionDefinition, ActionRequest, ActionResult, ActionStatus, AdminCommand,
    ArgumentDefinition, FileArgumentDefinition,
};

async fn serve_node(runtime: Arc<NodeRuntime>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind node server");
    let addr = listener.local_addr().unwrap();
    let app = server::router(runtime);
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

async fn dilution_node() -> (Arc<NodeRuntime>, String) {
    let runtime = Arc::new(
        NodeRuntime::new("liquid_handler", "pipettor")
            .with_upload_dir(std::env::temp_dir().join("workcelld-http-tests")),
    );
    runtime
        .register_action(
            ActionDefinition::new("dilute")
                .with_arg(ArgumentDefinition::required("factor", "number"))
                .with_file(FileArgumentDefinition::required("recipe")),
            action_handler(|ctx| async move {
                let factor = ctx.args["factor"].as_f64().unwrap_or(1.0);
                let recipe = ctx.files.get("recipe").cloned().unwrap_or_default();
                let content = tokio::fs::read_to_string(&recipe).await.unwrap_or_default();
                Ok(ActionResult::succeeded(ctx.action_id)
                    .with_data("factor", json!(factor))
                    .with_data("recipe_len", json!(content.len())))
            }),
        )
        .await;
    let url = serve_node(runtime.clone()).await;
    (runtime, url)
}

#[tokio::test]
async fn info_and_status_round_trip() {
    let (_runtime, url) = dilution_node().await;
    let client = RestNodeClient::new(url.as_str(), reqwest::Client::new());

    let info = client.get_info().await.unwrap();
    assert_eq!(info.node_name, "liquid_handler");
    assert!(info.actions.contains_key("dilute"));
    assert!(info.capabilities.send_action);

    let status = client.get_status().await.unwrap();
    assert!(status.ready);
    assert!(!status.busy);
}

#[tokio::test]
async fn three_phase_dispatch_with_file_upload() {
    let (_runtime, url) = dilution_node().await;
    let staging = tempfile::tempdir().unwrap();
    let recipe_path = staging.path().join("recipe.txt");
    tokio::fs::write(&recipe_path, "1:10 in PBS").await.unwrap();

    let client = RestNodeClient::new(url.as_str(), reqwest::Client::new());
    let mut request = ActionRequest::new("dilute");
    request.args.insert("factor".to_string(), json!(10));
    request.files.insert(
        "recipe".to_string(),
        recipe_path.to_string_lossy().to_string(),
    );

    let result = client
        .send_action(&request, true, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.status, ActionStatus::Succeeded);
    assert_eq!(result.data["factor"], json!(10.0));
    assert_eq!(result.data["recipe_len"], json!("1:10 in PBS".len()));

    // The engine's fallback path: the request id is the wire id.
    let fetched = client.get_action_result(&request.action_id).await.unwrap();
    assert_eq!(fetched.status, ActionStatus::Succeeded);
}

#[tokio::test]
async fn create_validation_failure_propagates_as_http_error() {
    let (_runtime, url) = dilution_node().await;
    let client = RestNodeClient::new(url.as_str(), reqwest::Client::new());

    // Missing the required "factor" argument: create answers 422 and the
    // client surfaces the HTTP error.
    let request = ActionRequest::new("dilute");
    let err = client
        .send_action(&request, false, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("rejected"));
}

#[tokio::test]
async fn admin_commands_over_the_wire() {
    let (runtime, url) = dilution_node().await;
    let client = RestNodeClient::new(url.as_str(), reqwest::Client::new());

    let response = client.send_admin_command(AdminCommand::Pause).await.unwrap();
    assert!(response.success);
    assert!(runtime.get_status().await.paused);

    client
        .send_admin_command(AdminCommand::Resume)
        .await
        .unwrap();
    assert!(!runtime.get_status().await.paused);
}

#[tokio::test]
async fn unsupported_admin_command_is_a_wire_error() {
    let runtime = Arc::new(
        NodeRuntime::new("minimal", "minimal_module").with_admin_commands([AdminCommand::Reset]),
    );
    let url = serve_node(runtime).await;
    let client = RestNodeClient::new(url.as_str(), reqwest::Client::new());

    // The node answers 501; error_for_status turns it into a client error.
    assert!(client
        .send_admin_command(AdminCommand::SafetyStop)
        .await
        .is_err());
}

#[tokio::test]
async fn set_config_round_trip() {
    let (_runtime, url) = dilution_node().await;
    let client = RestNodeClient::new(url.as_str(), reqwest::Client::new());

    let response = client
        .set_config(HashMap::from([("verbosity".to_string(), json!(3))]))
        .await
        .unwrap();
    assert_eq!(response.accepted["verbosity"], true);
    assert!(!response.reset_required);
}

#[tokio::test]
async fn file_results_download_over_the_wire() {
    let out_dir = tempfile::tempdir().unwrap();
    let out_path = out_dir.path().join("spectrum.csv");
    tokio::fs::write(&out_path, "wavelength,od\n600,0.42")
        .await
        .unwrap();

    let runtime = Arc::new(NodeRuntime::new("platereader", "reader"));
    let out_path_str = out_path.to_string_lossy().to_string();
    runtime
        .register_action(
            ActionDefinition::new("read"),
            action_handler(move |ctx| {
                let out_path = out_path_str.clone();
                async move {
                    Ok(ActionResult::succeeded(ctx.action_id).with_file("spectrum", out_path))
                }
            }),
        )
        .await;
    let url = serve_node(runtime).await;

    let client = RestNodeClient::new(url.as_str(), reqwest::Client::new());
    let request = ActionRequest::new("read");
    let result = client
        .send_action(&request, true, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.status, ActionStatus::Succeeded);

    let download_url = format!(
        "{}/action/read/{}/download/spectrum",
        url, request.action_id
    );
    let body = reqwest::get(&download_url).await.unwrap();
    assert!(body.status().is_success());
    let content = body.text().await.unwrap();
    assert!(content.contains("600,0.42"));
}
