//! Node runtime core
//!
//! The server-side half of the node contract. An instrument adapter builds
//! a `NodeRuntime`, declares its actions with `register_action` (schema +
//! async handler — the declared definition is the single source of the
//! wire schema), and mounts the REST router from `node::server` on top.
//!
//! Action requests move through the three-phase lifecycle:
//! create (validate args, record pending) → upload (one call per declared
//! file argument) → start (run the handler). `get_result` is idempotent
//! afterwards.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::{error, info};

use crate::types::{
    new_ulid, ActionDefinition, ActionResult, ActionStatus, AdminCommand, AdminCommandResponse,
    NodeCapabilities, NodeInfo, NodeSetConfigResponse, NodeStatus, WorkcellError,
};

// ═══════════════════════════════════════════════════════════════════════════
// Handlers & Context
// ═══════════════════════════════════════════════════════════════════════════

/// What an action handler receives: validated args (defaults applied) and
/// the staged paths of every uploaded file argument.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub action_id: String,
    pub args: HashMap<String, Value>,
    pub files: HashMap<String, PathBuf>,
}

/// An async action handler. Returning `Err` marks the action failed and
/// sets the node's `errored` flag; argument validation failures never do.
pub type ActionHandler = Arc<
    dyn Fn(ActionContext) -> Pin<Box<dyn Future<Output = Result<ActionResult, WorkcellError>> + Send>>
        + Send
        + Sync,
>;

/// Periodic refresher invoked by the background tickers.
pub type Refresher = Arc<
    dyn Fn(Arc<NodeRuntime>) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure as an [`ActionHandler`].
pub fn action_handler<F, Fut>(f: F) -> ActionHandler
where
    F: Fn(ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionResult, WorkcellError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

struct RegisteredAction {
    definition: ActionDefinition,
    handler: ActionHandler,
}

/// One entry in the node's event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// The lifecycle record of one action request.
#[derive(Debug, Clone)]
struct ActionRecord {
    action_name: String,
    args: HashMap<String, Value>,
    files: HashMap<String, PathBuf>,
    result: ActionResult,
    created_at: DateTime<Utc>,
    abort: Option<AbortHandle>,
}

// ═══════════════════════════════════════════════════════════════════════════
// NodeRuntime
// ═══════════════════════════════════════════════════════════════════════════

pub struct NodeRuntime {
    info: RwLock<NodeInfo>,
    status: RwLock<NodeStatus>,
    state: RwLock<HashMap<String, Value>>,
    config: RwLock<HashMap<String, Value>>,
    /// Config keys whose change requires a node reset to take effect.
    config_reset_keys: HashSet<String>,
    actions: RwLock<HashMap<String, RegisteredAction>>,
    records: RwLock<HashMap<String, ActionRecord>>,
    log: RwLock<HashMap<String, Event>>,
    upload_dir: PathBuf,
    status_refresher: RwLock<Option<Refresher>>,
    state_refresher: RwLock<Option<Refresher>>,
}

impl NodeRuntime {
    pub fn new(node_name: impl Into<String>, module_name: impl Into<String>) -> Self {
        let mut info = NodeInfo::new(node_name, module_name);
        info.capabilities = NodeCapabilities::rest_default();
        info.admin_commands = [
            AdminCommand::Reset,
            AdminCommand::Pause,
            AdminCommand::Resume,
            AdminCommand::Cancel,
            AdminCommand::Lock,
            AdminCommand::Unlock,
            AdminCommand::SafetyStop,
        ]
        .into_iter()
        .collect();

        Self {
            info: RwLock::new(info),
            status: RwLock::new(NodeStatus::default()),
            state: RwLock::new(HashMap::new()),
            config: RwLock::new(HashMap::new()),
            config_reset_keys: HashSet::new(),
            actions: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            log: RwLock::new(HashMap::new()),
            upload_dir: std::env::temp_dir().join("workcelld-node-uploads"),
            status_refresher: RwLock::new(None),
            state_refresher: RwLock::new(None),
        }
    }

    pub fn with_upload_dir(mut self, dir: PathBuf) -> Self {
        self.upload_dir = dir;
        self
    }

    pub fn with_config_reset_keys(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.config_reset_keys = keys.into_iter().collect();
        self
    }

    pub fn with_module_version(self, version: impl Into<String>) -> Self {
        {
            let info = self.info.try_write();
            if let Ok(mut info) = info {
                info.module_version = version.into();
            }
        }
        self
    }

    /// Restrict the admin vocabulary this node supports.
    pub fn with_admin_commands(self, commands: impl IntoIterator<Item = AdminCommand>) -> Self {
        if let Ok(mut info) = self.info.try_write() {
            info.admin_commands = commands.into_iter().collect();
        }
        self
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Registration
    // ═══════════════════════════════════════════════════════════════════════

    /// Declare an action: its wire schema and the handler that runs it.
    pub async fn register_action(&self, definition: ActionDefinition, handler: ActionHandler) {
        let name = definition.name.clone();
        self.info
            .write()
            .await
            .actions
            .insert(name.clone(), definition.clone());
        self.actions
            .write()
            .await
            .insert(name.clone(), RegisteredAction {
                definition,
                handler,
            });
        info!(action = %name, "Registered action");
    }

    pub async fn set_status_refresher(&self, refresher: Refresher) {
        *self.status_refresher.write().await = Some(refresher);
    }

    pub async fn set_state_refresher(&self, refresher: Refresher) {
        *self.state_refresher.write().await = Some(refresher);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Introspection
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get_info(&self) -> NodeInfo {
        self.info.read().await.clone()
    }

    pub async fn get_status(&self) -> NodeStatus {
        self.status.read().await.clone()
    }

    pub async fn get_state(&self) -> HashMap<String, Value> {
        self.state.read().await.clone()
    }

    pub async fn set_state_value(&self, key: impl Into<String>, value: Value) {
        self.state.write().await.insert(key.into(), value);
    }

    pub async fn get_log(&self) -> HashMap<String, Event> {
        self.log.read().await.clone()
    }

    pub async fn log_event(&self, level: &str, message: impl Into<String>) {
        let event = Event {
            event_id: new_ulid(),
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        };
        self.log.write().await.insert(event.event_id.clone(), event);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Config
    // ═══════════════════════════════════════════════════════════════════════

    /// Accept a partial config update. Every key is accepted and recorded;
    /// keys registered as reset keys flag `reset_required`.
    pub async fn set_config(&self, new_config: HashMap<String, Value>) -> NodeSetConfigResponse {
        let mut response = NodeSetConfigResponse::default();
        let mut config = self.config.write().await;
        let mut info = self.info.write().await;
        let mut status = self.status.write().await;
        for (key, value) in new_config {
            if self.config_reset_keys.contains(&key) {
                response.reset_required = true;
            }
            response.accepted.insert(key.clone(), true);
            info.config_values.insert(key.clone(), value.clone());
            config.insert(key.clone(), value);
            status.waiting_for_config.remove(&key);
        }
        response
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Admin commands
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn run_admin_command(&self, command: AdminCommand) -> AdminCommandResponse {
        let supported = self.info.read().await.admin_commands.contains(&command);
        if !supported {
            return AdminCommandResponse::failed(WorkcellError::new(
                "AdminCommandNotImplemented",
                format!("admin command {} is not supported by this node", command),
            ));
        }

        match command {
            AdminCommand::Pause => {
                self.status.write().await.paused = true;
            }
            AdminCommand::Resume => {
                self.status.write().await.paused = false;
            }
            AdminCommand::Lock => {
                self.status.write().await.locked = true;
            }
            AdminCommand::Unlock => {
                self.status.write().await.locked = false;
            }
            AdminCommand::SafetyStop => {
                self.status.write().await.stopped = true;
                self.cancel_running_actions().await;
            }
            AdminCommand::Cancel => {
                self.cancel_running_actions().await;
            }
            AdminCommand::Reset => {
                let mut status = self.status.write().await;
                status.errored = false;
                status.errors.clear();
                status.stopped = false;
                status.paused = false;
                status.locked = false;
                status.busy = false;
                status.running_actions.clear();
            }
            AdminCommand::Shutdown => {
                self.status.write().await.stopped = true;
            }
        }
        self.log_event("info", format!("admin command {}", command)).await;
        AdminCommandResponse::succeeded()
    }

    async fn cancel_running_actions(&self) {
        let mut records = self.records.write().await;
        let mut status = self.status.write().await;
        for (action_id, record) in records.iter_mut() {
            if record.result.status == ActionStatus::Running {
                if let Some(abort) = record.abort.take() {
                    abort.abort();
                }
                record.result.status = ActionStatus::Cancelled;
                status.running_actions.remove(action_id);
            }
        }
        status.busy = false;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Action lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Phase 1: validate argument presence and types, record a pending
    /// action, and hand back its id. Callers may supply the action id so
    /// they can correlate results after a transport failure; otherwise the
    /// node assigns one. Validation failures do not set the node's
    /// `errored` flag.
    pub async fn create_action(
        &self,
        action_name: &str,
        args: HashMap<String, Value>,
        provided_id: Option<String>,
    ) -> Result<String, ActionResult> {
        let actions = self.actions.read().await;
        let Some(registered) = actions.get(action_name) else {
            return Err(ActionResult::failed(
                new_ulid(),
                WorkcellError::new(
                    "ActionNotImplemented",
                    format!("action {} is not implemented by this node", action_name),
                ),
            ));
        };

        let mut bound = args;
        for arg in &registered.definition.args {
            if !bound.contains_key(&arg.name) {
                if let Some(default) = &arg.default {
                    bound.insert(arg.name.clone(), default.clone());
                } else if arg.required {
                    return Err(ActionResult::failed(
                        new_ulid(),
                        WorkcellError::new(
                            "ActionMissingArgument",
                            format!("required argument {} not provided", arg.name),
                        ),
                    ));
                }
            }
            if let Some(value) = bound.get(&arg.name) {
                if !type_matches(&arg.arg_type, value) {
                    return Err(ActionResult::failed(
                        new_ulid(),
                        WorkcellError::new(
                            "ActionArgumentType",
                            format!(
                                "argument {} expected {}, got {}",
                                arg.name,
                                arg.arg_type,
                                json_type_name(value)
                            ),
                        ),
                    ));
                }
            }
        }

        let action_id = provided_id.unwrap_or_else(new_ulid);
        let record = ActionRecord {
            action_name: action_name.to_string(),
            args: bound,
            files: HashMap::new(),
            result: ActionResult {
                action_id: action_id.clone(),
                status: ActionStatus::NotStarted,
                ..Default::default()
            },
            created_at: Utc::now(),
            abort: None,
        };
        self.records.write().await.insert(action_id.clone(), record);
        Ok(action_id)
    }

    /// Phase 2: stage one uploaded file argument.
    pub async fn upload_action_file(
        &self,
        action_id: &str,
        file_arg: &str,
        bytes: &[u8],
        file_name: &str,
    ) -> Result<PathBuf, WorkcellError> {
        let dir = self.upload_dir.join(action_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            WorkcellError::new("ActionFileUpload", format!("failed to stage upload: {}", e))
        })?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            WorkcellError::new("ActionFileUpload", format!("failed to stage upload: {}", e))
        })?;

        let mut records = self.records.write().await;
        let record = records.get_mut(action_id).ok_or_else(|| {
            WorkcellError::new("ActionNotFound", format!("no action {}", action_id))
        })?;
        record.files.insert(file_arg.to_string(), path.clone());
        Ok(path)
    }

    /// Phase 3: run the handler. Blocks until the action completes; while a
    /// blocking action runs the node is `busy` and further starts are
    /// rejected `NOT_READY`.
    pub async fn start_action(&self, action_id: &str) -> ActionResult {
        // Snapshot the record and its declared schema. A repeated start of
        // an already-started action replays the recorded result.
        let (action_name, args, files) = {
            let records = self.records.read().await;
            let Some(record) = records.get(action_id) else {
                return ActionResult::failed(
                    action_id.to_string(),
                    WorkcellError::new("ActionNotFound", format!("no action {}", action_id)),
                );
            };
            if record.result.status != ActionStatus::NotStarted {
                return record.result.clone();
            }
            (
                record.action_name.clone(),
                record.args.clone(),
                record.files.clone(),
            )
        };

        let (definition, handler) = {
            let actions = self.actions.read().await;
            let Some(registered) = actions.get(&action_name) else {
                return ActionResult::failed(
                    action_id.to_string(),
                    WorkcellError::new(
                        "ActionNotImplemented",
                        format!("action {} is not implemented by this node", action_name),
                    ),
                );
            };
            (registered.definition.clone(), registered.handler.clone())
        };

        // Missing declared files fail without setting `errored`.
        for file in &definition.files {
            if file.required && !files.contains_key(&file.name) {
                let result = ActionResult::failed(
                    action_id.to_string(),
                    WorkcellError::new(
                        "ActionMissingFile",
                        format!("required file {} not provided", file.name),
                    ),
                );
                self.store_result(action_id, result.clone()).await;
                return result;
            }
        }

        // Blocking policy.
        {
            let mut status = self.status.write().await;
            if definition.blocking && status.busy {
                return ActionResult {
                    action_id: action_id.to_string(),
                    status: ActionStatus::NotReady,
                    errors: vec![WorkcellError::new(
                        "NodeBusy",
                        "node is busy with a blocking action",
                    )],
                    ..Default::default()
                };
            }
            if definition.blocking {
                status.busy = true;
            }
            status.running_actions.insert(action_id.to_string());
        }
        self.mark_running(action_id).await;

        let context = ActionContext {
            action_id: action_id.to_string(),
            args,
            files,
        };
        let task = tokio::spawn((handler)(context));
        let abort = task.abort_handle();
        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(action_id) {
                record.abort = Some(abort);
            }
        }

        let outcome = task.await;

        let result = match outcome {
            Ok(Ok(mut result)) => {
                result.action_id = action_id.to_string();
                if !result.status.is_terminal() {
                    result.status = ActionStatus::Succeeded;
                }
                result
            }
            Ok(Err(error)) => {
                self.record_node_error(error.clone()).await;
                ActionResult::failed(action_id.to_string(), error)
            }
            Err(join_error) if join_error.is_cancelled() => ActionResult {
                action_id: action_id.to_string(),
                status: ActionStatus::Cancelled,
                ..Default::default()
            },
            Err(join_error) => {
                let error = WorkcellError::new(
                    "ActionException",
                    format!("action handler panicked: {}", join_error),
                );
                self.record_node_error(error.clone()).await;
                ActionResult::failed(action_id.to_string(), error)
            }
        };

        {
            let mut status = self.status.write().await;
            status.running_actions.remove(action_id);
            if definition.blocking {
                status.busy = false;
            }
        }
        self.store_result(action_id, result.clone()).await;
        result
    }

    async fn mark_running(&self, action_id: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(action_id) {
            record.result.status = ActionStatus::Running;
        }
    }

    async fn store_result(&self, action_id: &str, result: ActionResult) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(action_id) {
            // A cancel that landed while the handler was finishing wins.
            if record.result.status != ActionStatus::Cancelled {
                record.result = result;
            }
            record.abort = None;
        }
    }

    async fn record_node_error(&self, error: WorkcellError) {
        let mut status = self.status.write().await;
        status.errored = true;
        status.errors.push(error.clone());
        drop(status);
        self.log_event("error", error.to_string()).await;
    }

    /// Idempotent result fetch.
    pub async fn get_action_result(&self, action_id: &str) -> Option<ActionResult> {
        self.records
            .read()
            .await
            .get(action_id)
            .map(|r| r.result.clone())
    }

    pub async fn get_action_status(&self, action_id: &str) -> Option<ActionStatus> {
        self.records
            .read()
            .await
            .get(action_id)
            .map(|r| r.result.status)
    }

    /// All recorded actions, most recent first.
    pub async fn action_history(&self) -> Vec<ActionResult> {
        let records = self.records.read().await;
        let mut entries: Vec<(&DateTime<Utc>, &ActionRecord)> = records
            .values()
            .map(|record| (&record.created_at, record))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(a.0));
        entries.into_iter().map(|(_, r)| r.result.clone()).collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Periodic handlers
    // ═══════════════════════════════════════════════════════════════════════

    /// Spawn the status and state refresh tickers. Both are crash-safe:
    /// refresher failures are logged and the ticker continues.
    pub fn start_periodic_handlers(self: Arc<Self>, interval: Duration) {
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let refresher = runtime.status_refresher.read().await.clone();
                if let Some(refresher) = refresher {
                    if let Err(e) = refresher(runtime.clone()).await {
                        error!("Status refresher error: {}", e);
                    }
                }
            }
        });

        let runtime = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let refresher = runtime.state_refresher.read().await.clone();
                if let Some(refresher) = refresher {
                    if let Err(e) = refresher(runtime.clone()).await {
                        error!("State refresher error: {}", e);
                    }
                }
            }
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Argument typing
// ═══════════════════════════════════════════════════════════════════════════

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
