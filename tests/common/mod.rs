//! Shared test fixtures: a scripted node client and workflow builders.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use workcelld::clients::DataClient;
use workcelld::engine::Engine;
use workcelld::node::client::{NodeClient, NodeClientFactory};
use workcelld::state::{StateHandler, WorkcellDefinition};
use workcelld::types::{
    ActionRequest, ActionResult, ActionStatus, AdminCommand, AdminCommandResponse, Node,
    NodeCapabilities, NodeInfo, NodeSetConfigResponse, NodeStatus,
};
use workcelld::workflow::{Step, Workflow};

/// One scripted reply for a client call.
pub type Scripted = Result<ActionResult, String>;

/// A node client driven by queues of scripted results. With an empty
/// script every send succeeds.
#[derive(Default)]
pub struct ScriptedClient {
    pub send_results: Mutex<VecDeque<Scripted>>,
    pub fallback_results: Mutex<VecDeque<Scripted>>,
    pub requests: Mutex<Vec<ActionRequest>>,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn script_send(&self, result: Scripted) {
        self.send_results.lock().await.push_back(result);
    }

    pub async fn script_fallback(&self, result: Scripted) {
        self.fallback_results.lock().await.push_back(result);
    }

    pub async fn recorded_requests(&self) -> Vec<ActionRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl NodeClient for ScriptedClient {
    fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities::rest_default()
    }

    async fn get_info(&self) -> Result<NodeInfo> {
        Ok(NodeInfo::new("scripted", "scripted_module"))
    }

    async fn get_status(&self) -> Result<NodeStatus> {
        Ok(NodeStatus::default())
    }

    async fn get_state(&self) -> Result<HashMap<String, Value>> {
        Ok(HashMap::new())
    }

    async fn get_log(&self) -> Result<HashMap<String, Value>> {
        Ok(HashMap::new())
    }

    async fn send_action(
        &self,
        request: &ActionRequest,
        _await_result: bool,
        _timeout: Duration,
    ) -> Result<ActionResult> {
        self.requests.lock().await.push(request.clone());
        match self.send_results.lock().await.pop_front() {
            Some(Ok(mut result)) => {
                if result.action_id.is_empty() {
                    result.action_id = request.action_id.clone();
                }
                Ok(result)
            }
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(ActionResult::succeeded(request.action_id.clone())),
        }
    }

    async fn get_action_result(&self, action_id: &str) -> Result<ActionResult> {
        match self.fallback_results.lock().await.pop_front() {
            Some(Ok(mut result)) => {
                if result.action_id.is_empty() {
                    result.action_id = action_id.to_string();
                }
                Ok(result)
            }
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no recorded result for {}", action_id)),
        }
    }

    async fn get_action_status(&self, _action_id: &str) -> Result<ActionStatus> {
        Ok(ActionStatus::Unknown)
    }

    async fn set_config(&self, _config: HashMap<String, Value>) -> Result<NodeSetConfigResponse> {
        Ok(NodeSetConfigResponse::default())
    }

    async fn send_admin_command(&self, _command: AdminCommand) -> Result<AdminCommandResponse> {
        Ok(AdminCommandResponse::succeeded())
    }
}

/// Hands every node the same scripted client.
pub struct ScriptedFactory {
    pub client: Arc<ScriptedClient>,
}

#[async_trait]
impl NodeClientFactory for ScriptedFactory {
    async fn client_for(&self, _node_name: &str, _node: &Node) -> Result<Arc<dyn NodeClient>> {
        Ok(self.client.clone())
    }
}

/// An engine over in-memory state with a scripted client.
pub struct TestHarness {
    pub state: Arc<StateHandler>,
    pub engine: Engine,
    pub client: Arc<ScriptedClient>,
}

pub fn harness() -> TestHarness {
    let state = Arc::new(StateHandler::in_memory(WorkcellDefinition::new(
        "Test Workcell",
    )));
    let client = ScriptedClient::new();
    let data = Arc::new(DataClient::local(
        std::env::temp_dir().join("workcelld-tests"),
    ));
    let engine = Engine::new(
        state.clone(),
        data,
        Arc::new(ScriptedFactory {
            client: client.clone(),
        }),
        Duration::from_secs(5),
    );
    TestHarness {
        state,
        engine,
        client,
    }
}

/// A bare step against `node` running `action`.
pub fn step(name: &str, node: &str, action: &str) -> Step {
    Step {
        step_id: workcelld::types::new_ulid(),
        key: None,
        name: name.to_string(),
        node: node.to_string(),
        action: action.to_string(),
        args: HashMap::new(),
        files: HashMap::new(),
        use_parameters: None,
        data_labels: HashMap::new(),
        status: ActionStatus::NotStarted,
        result: None,
        conditions: vec![],
        locations: HashMap::new(),
        timeout: None,
    }
}

/// A queued workflow over the given steps, as the control plane would
/// leave it after submission.
pub async fn submit(harness: &TestHarness, name: &str, steps: Vec<Step>) -> Workflow {
    let mut workflow = Workflow {
        workflow_id: workcelld::types::new_ulid(),
        name: name.to_string(),
        workflow_definition_id: workcelld::types::new_ulid(),
        parameters: Default::default(),
        parameter_values: HashMap::new(),
        file_input_ids: HashMap::new(),
        steps,
        status: Default::default(),
        scheduler_metadata: Default::default(),
        start_time: None,
        end_time: None,
        submitted_time: Some(chrono::Utc::now()),
        ownership: Default::default(),
    };
    workflow.status.queued = true;
    harness
        .state
        .set_active_workflow(workflow.clone())
        .await
        .unwrap();
    harness
        .state
        .enqueue_workflow(&workflow.workflow_id)
        .await
        .unwrap();
    workflow
}

/// Register a node that accepts actions.
pub async fn ready_node(harness: &TestHarness, name: &str) {
    harness
        .state
        .set_node(
            name,
            Node::new(format!("http://{}", name)).with_status(NodeStatus::default()),
        )
        .await
        .unwrap();
}

/// Poll until `predicate` holds for the workflow, or panic after ~2s.
pub async fn wait_for<F>(harness: &TestHarness, workflow_id: &str, predicate: F) -> Workflow
where
    F: Fn(&Workflow) -> bool,
{
    for _ in 0..100 {
        if let Some(workflow) = harness.state.get_workflow(workflow_id).await {
            if predicate(&workflow) {
                return workflow;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("workflow {} never reached the expected state", workflow_id);
}
