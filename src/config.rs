//! Configuration module - Environment-based configuration
//!
//! All knobs come from `WORKCELL_*` environment variables (with `.env`
//! support via dotenvy in main).

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::clients::DataClient;
use crate::engine::Engine;
use crate::error::StateError;
use crate::node::client::{NodeClientFactory, RestNodeClientFactory};
use crate::state::{StateHandler, WorkcellDefinition};
use crate::types::Node;

/// Workcell manager configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Server config
    pub host: String,
    pub port: u16,

    // Workcell identity
    pub workcell_name: String,

    // Durable state snapshot; unset runs in-memory.
    pub state_path: Option<PathBuf>,

    // Datapoint store; unset keeps datapoints in-process.
    pub data_url: Option<String>,

    // Where uploaded/downloaded files are staged.
    pub file_dir: PathBuf,

    // Loop intervals
    pub tick_ms: u64,
    pub node_poll_ms: u64,

    // Step dispatch
    pub step_timeout_s: u64,
    pub client_max_attempts: u32,

    // Terminal workflows are archived after this many seconds.
    pub retention_s: i64,

    // Reject submissions referencing unregistered nodes.
    pub strict_nodes: bool,

    // Seed nodes: "name=url,name2=url2".
    pub seed_nodes: HashMap<String, String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let host = env::var("WORKCELL_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("WORKCELL_PORT")
            .unwrap_or_else(|_| "8005".to_string())
            .parse()
            .unwrap_or(8005);

        let seed_nodes = env::var("WORKCELL_NODES")
            .unwrap_or_default()
            .split(',')
            .filter_map(|pair| {
                let (name, url) = pair.split_once('=')?;
                Some((name.trim().to_string(), url.trim().to_string()))
            })
            .collect();

        Self {
            host,
            port,
            workcell_name: env::var("WORKCELL_NAME").unwrap_or_else(|_| "workcell".to_string()),
            state_path: env::var("WORKCELL_STATE_PATH").ok().map(PathBuf::from),
            data_url: env::var("WORKCELL_DATA_URL").ok(),
            file_dir: env::var("WORKCELL_FILE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("workcelld")),
            tick_ms: env_parse("WORKCELL_TICK_MS", 1000),
            node_poll_ms: env_parse("WORKCELL_NODE_POLL_MS", 2000),
            step_timeout_s: env_parse("WORKCELL_STEP_TIMEOUT_S", 300),
            client_max_attempts: env_parse("WORKCELL_CLIENT_MAX_ATTEMPTS", 3),
            retention_s: env_parse("WORKCELL_RETENTION_S", 300),
            strict_nodes: env::var("WORKCELL_STRICT_NODES")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            seed_nodes,
        }
    }

    /// Get server bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn node_poll(&self) -> Duration {
        Duration::from_millis(self.node_poll_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_s)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Shared application state threaded through every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub state: Arc<StateHandler>,
    pub data: Arc<DataClient>,
    pub clients: Arc<dyn NodeClientFactory>,
    pub engine: Engine,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self, StateError> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        let workcell = WorkcellDefinition {
            workcell_id: crate::types::new_ulid(),
            name: config.workcell_name.clone(),
            description: String::new(),
            nodes: config.seed_nodes.clone(),
        };

        let state = Arc::new(StateHandler::new(
            workcell,
            config.state_path.clone(),
            config.retention_s,
        )?);

        // Seed the registry with configured nodes not already known.
        for (name, url) in &config.seed_nodes {
            if state.get_node(name).await.is_none() {
                state.set_node(name, Node::new(url)).await?;
            }
        }

        let data = Arc::new(match &config.data_url {
            Some(url) => DataClient::remote(url, http_client.clone()),
            None => DataClient::local(config.file_dir.join("datapoints")),
        });

        let clients: Arc<dyn NodeClientFactory> = Arc::new(
            RestNodeClientFactory::new(http_client.clone(), config.file_dir.join("downloads"))
                .with_max_attempts(config.client_max_attempts),
        );

        let engine = Engine::new(
            state.clone(),
            data.clone(),
            clients.clone(),
            config.step_timeout(),
        );

        Ok(Self {
            config: Arc::new(config),
            http_client,
            state,
            data,
            clients,
            engine,
        })
    }
}
