//! Transport-abstract node clients
//!
//! The engine talks to every instrument through the `NodeClient` trait.
//! `RestNodeClient` implements the canonical REST contract: three-phase
//! action dispatch (create → upload → start), result polling with
//! exponential backoff, binary results with metadata in `x-madsci-*`
//! headers, and doubling-timeout transport retry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Response;
use serde_json::Value;
use tracing::{debug, warn};

use crate::types::{
    headers, ActionRequest, ActionResult, ActionStatus, AdminCommand, AdminCommandResponse, Node,
    NodeCapabilities, NodeInfo, NodeSetConfigResponse, NodeStatus, WorkcellError,
};

/// Initial delay of the result-polling backoff.
const POLL_INITIAL: Duration = Duration::from_millis(250);
/// Backoff multiplier per poll.
const POLL_FACTOR: f64 = 1.5;
/// Backoff ceiling.
const POLL_CAP: Duration = Duration::from_secs(5);
/// First per-request timeout of the doubling transport retry.
const RETRY_BASE_TIMEOUT: Duration = Duration::from_secs(10);

// ═══════════════════════════════════════════════════════════════════════════
// NodeClient trait
// ═══════════════════════════════════════════════════════════════════════════

/// Transport-agnostic RPC surface of a node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    fn capabilities(&self) -> NodeCapabilities;

    async fn get_info(&self) -> Result<NodeInfo>;
    async fn get_status(&self) -> Result<NodeStatus>;
    async fn get_state(&self) -> Result<HashMap<String, Value>>;
    async fn get_log(&self) -> Result<HashMap<String, Value>>;

    /// Perform create + upload + start. When `await_result` is set, poll
    /// `get_action_result` until the status is terminal or `timeout`
    /// elapses.
    async fn send_action(
        &self,
        request: &ActionRequest,
        await_result: bool,
        timeout: Duration,
    ) -> Result<ActionResult>;

    async fn get_action_result(&self, action_id: &str) -> Result<ActionResult>;
    async fn get_action_status(&self, action_id: &str) -> Result<ActionStatus>;

    async fn set_config(&self, config: HashMap<String, Value>) -> Result<NodeSetConfigResponse>;
    async fn send_admin_command(&self, command: AdminCommand) -> Result<AdminCommandResponse>;
}

/// Hands the engine a client for a registry entry. The seam tests use to
/// substitute scripted clients.
#[async_trait]
pub trait NodeClientFactory: Send + Sync {
    async fn client_for(&self, node_name: &str, node: &Node) -> Result<Arc<dyn NodeClient>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// REST implementation
// ═══════════════════════════════════════════════════════════════════════════

pub struct RestNodeClient {
    base_url: String,
    http: reqwest::Client,
    /// Retry transport timeouts with doubling per-request timeouts.
    retry: bool,
    max_attempts: u32,
    /// Where binary action results are staged.
    download_dir: PathBuf,
}

impl RestNodeClient {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            retry: false,
            max_attempts: 3,
            download_dir: std::env::temp_dir().join("workcelld-downloads"),
        }
    }

    pub fn with_retry(mut self, max_attempts: u32) -> Self {
        self.retry = true;
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_download_dir(mut self, dir: PathBuf) -> Self {
        self.download_dir = dir;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET with the doubling-timeout retry policy. Timeouts retry (when
    /// configured); HTTP error statuses propagate immediately.
    async fn get_with_retry(&self, path: &str) -> Result<Response> {
        let url = self.url(path);
        let mut attempt: u32 = 0;
        loop {
            let timeout = RETRY_BASE_TIMEOUT * 2u32.pow(attempt);
            let result = self.http.get(&url).timeout(timeout).send().await;
            match result {
                Ok(response) => {
                    return response
                        .error_for_status()
                        .with_context(|| format!("GET {} failed", url));
                }
                Err(err) if err.is_timeout() && self.retry && attempt + 1 < self.max_attempts => {
                    warn!(url = %url, attempt, "Transport timeout, retrying with doubled timeout");
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("GET {} failed", url));
                }
            }
        }
    }

    /// Parse an action-result response: JSON envelope, or a binary body
    /// with metadata in `x-madsci-*` headers.
    async fn parse_action_response(&self, response: Response) -> Result<ActionResult> {
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);

        if is_json {
            return response
                .json()
                .await
                .context("Failed to parse action result");
        }

        let header_map = response.headers().clone();
        let mut result = result_from_headers(&header_map)?;

        // Stage the body to disk. A multi-file result arrives as one
        // archive; it is stored unexpanded and referenced by every label.
        let body = response
            .bytes()
            .await
            .context("Failed to read binary action result")?;
        let dir = self.download_dir.join(&result.action_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .context("Failed to create download directory")?;

        let labels: Vec<String> = result.files.keys().cloned().collect();
        let file_name = match labels.as_slice() {
            [single] => result
                .files
                .get(single)
                .cloned()
                .unwrap_or_else(|| single.clone()),
            _ => "results.zip".to_string(),
        };
        let path = dir.join(&file_name);
        tokio::fs::write(&path, &body)
            .await
            .context("Failed to stage downloaded file")?;
        let path_str = path.to_string_lossy().to_string();
        for label in labels {
            result.files.insert(label, path_str.clone());
        }
        Ok(result)
    }
}

/// Decode `ActionResult` metadata from response headers.
fn result_from_headers(header_map: &HeaderMap) -> Result<ActionResult> {
    let get = |name: &str| {
        header_map
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };

    let status: ActionStatus = match get(headers::STATUS) {
        Some(raw) => serde_json::from_str(&format!("\"{}\"", raw.trim_matches('"')))
            .with_context(|| format!("bad status header: {}", raw))?,
        None => ActionStatus::Unknown,
    };
    let action_id = get(headers::ACTION_ID).unwrap_or_default();

    let decode_map = |raw: Option<String>| -> HashMap<String, String> {
        raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
    };
    let errors: Vec<WorkcellError> = get(headers::ERRORS)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let data: HashMap<String, Value> = get(headers::DATA)
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(ActionResult {
        action_id,
        status,
        errors,
        data,
        files: decode_map(get(headers::FILES)),
        datapoints: decode_map(get(headers::DATAPOINTS)),
    })
}

#[async_trait]
impl NodeClient for RestNodeClient {
    fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities::rest_default()
    }

    async fn get_info(&self) -> Result<NodeInfo> {
        self.get_with_retry("/info")
            .await?
            .json()
            .await
            .context("Failed to parse node info")
    }

    async fn get_status(&self) -> Result<NodeStatus> {
        self.get_with_retry("/status")
            .await?
            .json()
            .await
            .context("Failed to parse node status")
    }

    async fn get_state(&self) -> Result<HashMap<String, Value>> {
        self.get_with_retry("/state")
            .await?
            .json()
            .await
            .context("Failed to parse node state")
    }

    async fn get_log(&self) -> Result<HashMap<String, Value>> {
        self.get_with_retry("/log")
            .await?
            .json()
            .await
            .context("Failed to parse node log")
    }

    async fn send_action(
        &self,
        request: &ActionRequest,
        await_result: bool,
        timeout: Duration,
    ) -> Result<ActionResult> {
        // Phase 1: create. The node validates arguments. The request's
        // action id is offered so a transport failure later can still be
        // correlated through get_action_result.
        let url = self.url(&format!("/action/{}", request.action_name));
        let response = self
            .http
            .post(&url)
            .query(&[("action_id", request.action_id.as_str())])
            .json(&request.args)
            .send()
            .await
            .with_context(|| format!("Failed to create action {}", request.action_name))?
            .error_for_status()
            .with_context(|| format!("Create action {} rejected", request.action_name))?;
        let created: Value = response
            .json()
            .await
            .context("Failed to parse create-action response")?;
        let action_id = created
            .get("action_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("create-action response missing action_id"))?
            .to_string();

        // Phase 2: upload each declared file argument.
        for (file_arg, path) in &request.files {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read file argument {} from {}", file_arg, path))?;
            let file_name = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| file_arg.clone());
            let form = reqwest::multipart::Form::new().part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );
            let upload_url = self.url(&format!(
                "/action/{}/{}/upload/{}",
                request.action_name, action_id, file_arg
            ));
            self.http
                .post(&upload_url)
                .multipart(form)
                .send()
                .await
                .with_context(|| format!("Failed to upload file argument {}", file_arg))?
                .error_for_status()
                .with_context(|| format!("Upload of {} rejected", file_arg))?;
        }

        // Phase 3: start.
        let start_url = self.url(&format!(
            "/action/{}/{}/start",
            request.action_name, action_id
        ));
        let response = self
            .http
            .post(&start_url)
            .send()
            .await
            .with_context(|| format!("Failed to start action {}", action_id))?
            .error_for_status()
            .with_context(|| format!("Start of action {} rejected", action_id))?;
        let mut result = self.parse_action_response(response).await?;
        if result.action_id.is_empty() {
            result.action_id = action_id.clone();
        }

        if !await_result || result.status.is_terminal() {
            return Ok(result);
        }

        // Poll until terminal, with exponential backoff.
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = POLL_INITIAL;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("TimeoutError: action {} timed out", action_id));
            }
            tokio::time::sleep(delay).await;
            delay = POLL_CAP.min(delay.mul_f64(POLL_FACTOR));

            let polled = self.get_action_result(&action_id).await?;
            debug!(action_id = %action_id, status = %polled.status, "Polled action result");
            if polled.status.is_terminal() {
                return Ok(polled);
            }
        }
    }

    async fn get_action_result(&self, action_id: &str) -> Result<ActionResult> {
        let response = self
            .get_with_retry(&format!("/action/{}/result", action_id))
            .await?;
        self.parse_action_response(response).await
    }

    async fn get_action_status(&self, action_id: &str) -> Result<ActionStatus> {
        self.get_with_retry(&format!("/action/{}/status", action_id))
            .await?
            .json()
            .await
            .context("Failed to parse action status")
    }

    async fn set_config(&self, config: HashMap<String, Value>) -> Result<NodeSetConfigResponse> {
        self.http
            .post(self.url("/config"))
            .json(&config)
            .send()
            .await
            .context("Failed to send config")?
            .error_for_status()
            .context("Set config rejected")?
            .json()
            .await
            .context("Failed to parse set-config response")
    }

    async fn send_admin_command(&self, command: AdminCommand) -> Result<AdminCommandResponse> {
        self.http
            .post(self.url(&format!("/admin/{}", command)))
            .send()
            .await
            .with_context(|| format!("Failed to send admin command {}", command))?
            .error_for_status()
            .with_context(|| format!("Admin command {} rejected", command))?
            .json()
            .await
            .context("Failed to parse admin command response")
    }
}

/// Default factory: a REST client per registry entry.
pub struct RestNodeClientFactory {
    http: reqwest::Client,
    download_dir: PathBuf,
    retry: bool,
    max_attempts: u32,
}

impl RestNodeClientFactory {
    pub fn new(http: reqwest::Client, download_dir: PathBuf) -> Self {
        Self {
            http,
            download_dir,
            retry: true,
            max_attempts: 3,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[async_trait]
impl NodeClientFactory for RestNodeClientFactory {
    async fn client_for(&self, node_name: &str, node: &Node) -> Result<Arc<dyn NodeClient>> {
        let mut client = RestNodeClient::new(&node.node_url, self.http.clone())
            .with_download_dir(self.download_dir.join(node_name));
        if self.retry {
            client = client.with_retry(self.max_attempts);
        }
        Ok(Arc::new(client))
    }
}
