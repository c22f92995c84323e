//! RestNodeClient transport behavior against a mocked wire.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use workcelld::node::client::{NodeClient, RestNodeClient};
use workcelld::types::{headers, ActionRequest, ActionStatus};

#[tokio::test]
async fn http_errors_propagate_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let client = RestNodeClient::new(server.uri(), reqwest::Client::new()).with_retry(3);
    assert!(client.get_status().await.is_err());
}

#[tokio::test]
async fn await_result_polls_until_terminal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/action/read"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "action_id": "act-1" })))
        .mount(&server)
        .await;

    // start reports the action still running...
    Mock::given(method("POST"))
        .and(path("/action/read/act-1/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action_id": "act-1",
            "status": "RUNNING"
        })))
        .mount(&server)
        .await;

    // ...and the result endpoint reports completion.
    Mock::given(method("GET"))
        .and(path("/action/act-1/result"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action_id": "act-1",
            "status": "SUCCEEDED",
            "data": { "reading": 7 }
        })))
        .mount(&server)
        .await;

    let client = RestNodeClient::new(server.uri(), reqwest::Client::new());
    let request = ActionRequest::new("read");
    let result = client
        .send_action(&request, true, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.status, ActionStatus::Succeeded);
    assert_eq!(result.data["reading"], json!(7));
}

#[tokio::test]
async fn await_result_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/action/read"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "action_id": "act-2" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/action/read/act-2/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action_id": "act-2",
            "status": "RUNNING"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/action/act-2/result"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action_id": "act-2",
            "status": "RUNNING"
        })))
        .mount(&server)
        .await;

    let client = RestNodeClient::new(server.uri(), reqwest::Client::new());
    let request = ActionRequest::new("read");
    let err = client
        .send_action(&request, true, Duration::from_millis(600))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("TimeoutError"));
}

#[tokio::test]
async fn binary_result_reads_metadata_from_headers() {
    let server = MockServer::start().await;
    let staging = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/action/act-3/result"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/octet-stream")
                .insert_header(headers::STATUS, "SUCCEEDED")
                .insert_header(headers::ACTION_ID, "act-3")
                .insert_header(headers::FILES, "{\"spectrum\":\"spectrum.csv\"}")
                .insert_header(headers::DATA, "{\"count\":2}")
                .insert_header(headers::DATAPOINTS, "{\"spectrum\":\"dp_9\"}")
                .set_body_bytes(b"wavelength,od\n600,0.42".to_vec()),
        )
        .mount(&server)
        .await;

    let client = RestNodeClient::new(server.uri(), reqwest::Client::new())
        .with_download_dir(staging.path().to_path_buf());
    let result = client.get_action_result("act-3").await.unwrap();

    assert_eq!(result.status, ActionStatus::Succeeded);
    assert_eq!(result.action_id, "act-3");
    assert_eq!(result.data["count"], json!(2));
    assert_eq!(result.datapoints["spectrum"], "dp_9");

    // The body landed on disk and the files map points at it.
    let staged = result.files["spectrum"].clone();
    let content = tokio::fs::read_to_string(&staged).await.unwrap();
    assert!(content.contains("600,0.42"));
}

#[tokio::test]
async fn upload_phase_sends_each_file_argument() {
    let server = MockServer::start().await;
    let staging = tempfile::tempdir().unwrap();
    let protocol = staging.path().join("protocol.txt");
    tokio::fs::write(&protocol, "mix well").await.unwrap();

    Mock::given(method("POST"))
        .and(path("/action/mix"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "action_id": "act-4" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/action/mix/act-4/upload/protocol"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "staged": "ok" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/action/mix/act-4/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "action_id": "act-4",
            "status": "SUCCEEDED"
        })))
        .mount(&server)
        .await;

    let client = RestNodeClient::new(server.uri(), reqwest::Client::new());
    let mut request = ActionRequest::new("mix");
    request.files.insert(
        "protocol".to_string(),
        protocol.to_string_lossy().to_string(),
    );
    let result = client
        .send_action(&request, true, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.status, ActionStatus::Succeeded);
}
