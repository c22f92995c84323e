//! Shared data types for the workcell orchestration core
//!
//! Covers:
//! - Entity identifiers (ULID) and the common error envelope
//! - Action request/result lifecycle types
//! - Node status, info, capabilities, and declared action schemas
//! - Admin commands, locations, and ownership context

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

// ═══════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════

/// Generate a fresh entity identifier.
///
/// All entity ids (workflows, steps, actions, datapoints, locations) are
/// 26-character Crockford-base32 ULIDs, lexicographically sortable by
/// creation time.
pub fn new_ulid() -> String {
    Ulid::new().to_string()
}

// ═══════════════════════════════════════════════════════════════════════════
// Error Envelope
// ═══════════════════════════════════════════════════════════════════════════

/// Uniform error carrier attached to action results, node status, and
/// workflow step failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkcellError {
    pub message: String,
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl WorkcellError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for WorkcellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Action Status
// ═══════════════════════════════════════════════════════════════════════════

/// Status of an action request on a node, also used as the per-step status
/// inside a workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Unknown,
    NotReady,
    Paused,
}

impl ActionStatus {
    /// Terminal states: the action will not progress further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Succeeded | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionStatus::NotStarted => "NOT_STARTED",
            ActionStatus::Running => "RUNNING",
            ActionStatus::Succeeded => "SUCCEEDED",
            ActionStatus::Failed => "FAILED",
            ActionStatus::Cancelled => "CANCELLED",
            ActionStatus::Unknown => "UNKNOWN",
            ActionStatus::NotReady => "NOT_READY",
            ActionStatus::Paused => "PAUSED",
        };
        write!(f, "{}", s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Action Request / Result
// ═══════════════════════════════════════════════════════════════════════════

/// A request to run a named action on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_id: String,
    pub action_name: String,
    #[serde(default)]
    pub args: HashMap<String, Value>,
    /// File arguments: argument name → local path to upload.
    #[serde(default)]
    pub files: HashMap<String, String>,
}

impl ActionRequest {
    pub fn new(action_name: impl Into<String>) -> Self {
        Self {
            action_id: new_ulid(),
            action_name: action_name.into(),
            args: HashMap::new(),
            files: HashMap::new(),
        }
    }
}

/// Result of an action request, as reported by the node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActionResult {
    #[serde(default)]
    pub action_id: String,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<WorkcellError>,
    /// Named JSON outputs.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, Value>,
    /// Named file outputs: result label → path on disk.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub files: HashMap<String, String>,
    /// Promoted datapoints: result label → datapoint id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub datapoints: HashMap<String, String>,
}

impl ActionResult {
    pub fn succeeded(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Succeeded,
            ..Default::default()
        }
    }

    pub fn failed(action_id: impl Into<String>, error: WorkcellError) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Failed,
            errors: vec![error],
            ..Default::default()
        }
    }

    pub fn unknown(action_id: impl Into<String>, error: WorkcellError) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Unknown,
            errors: vec![error],
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_file(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.files.insert(key.into(), path.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Action Definitions (declared schemas)
// ═══════════════════════════════════════════════════════════════════════════

/// Declared JSON argument of an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgumentDefinition {
    pub name: String,
    /// Expected JSON type: "string", "number", "boolean", "array", "object",
    /// or "any".
    #[serde(default = "default_arg_type", rename = "type")]
    pub arg_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_arg_type() -> String {
    "any".to_string()
}

impl ArgumentDefinition {
    pub fn required(name: impl Into<String>, arg_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arg_type: arg_type.into(),
            required: true,
            default: None,
            description: String::new(),
        }
    }

    pub fn optional(
        name: impl Into<String>,
        arg_type: impl Into<String>,
        default: Option<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            arg_type: arg_type.into(),
            required: false,
            default,
            description: String::new(),
        }
    }
}

/// Declared file argument of an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileArgumentDefinition {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl FileArgumentDefinition {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            description: String::new(),
        }
    }
}

/// Declared result of an action (JSON value or file), keyed by label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultDefinition {
    pub label: String,
    /// "json" or "file".
    #[serde(default = "default_result_type", rename = "type")]
    pub result_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn default_result_type() -> String {
    "json".to_string()
}

/// The declarative schema of a node action. This is the wire form: no
/// host-language reflection crosses the node boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub args: Vec<ArgumentDefinition>,
    #[serde(default)]
    pub files: Vec<FileArgumentDefinition>,
    #[serde(default)]
    pub results: Vec<ResultDefinition>,
    /// Blocking actions hold the node `busy` until they clear.
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

fn default_blocking() -> bool {
    true
}

impl ActionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            args: Vec::new(),
            files: Vec::new(),
            results: Vec::new(),
            blocking: true,
        }
    }

    pub fn with_arg(mut self, arg: ArgumentDefinition) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_file(mut self, file: FileArgumentDefinition) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_result(mut self, result: ResultDefinition) -> Self {
        self.results.push(result);
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Admin Commands
// ═══════════════════════════════════════════════════════════════════════════

/// Fixed vocabulary of operational signals a node may support.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AdminCommand {
    Reset,
    Shutdown,
    Pause,
    Resume,
    Cancel,
    Lock,
    Unlock,
    SafetyStop,
}

impl AdminCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminCommand::Reset => "reset",
            AdminCommand::Shutdown => "shutdown",
            AdminCommand::Pause => "pause",
            AdminCommand::Resume => "resume",
            AdminCommand::Cancel => "cancel",
            AdminCommand::Lock => "lock",
            AdminCommand::Unlock => "unlock",
            AdminCommand::SafetyStop => "safety_stop",
        }
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AdminCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reset" => Ok(AdminCommand::Reset),
            "shutdown" => Ok(AdminCommand::Shutdown),
            "pause" => Ok(AdminCommand::Pause),
            "resume" => Ok(AdminCommand::Resume),
            "cancel" => Ok(AdminCommand::Cancel),
            "lock" => Ok(AdminCommand::Lock),
            "unlock" => Ok(AdminCommand::Unlock),
            "safety_stop" => Ok(AdminCommand::SafetyStop),
            other => Err(format!("unknown admin command: {}", other)),
        }
    }
}

/// Response to an admin command invocation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminCommandResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<WorkcellError>,
}

impl AdminCommandResponse {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(error: WorkcellError) -> Self {
        Self {
            success: false,
            errors: vec![error],
        }
    }
}

/// Response to a partial config update: per-key accept/reject plus whether
/// the node needs a reset for the accepted values to take effect.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeSetConfigResponse {
    #[serde(default)]
    pub accepted: HashMap<String, bool>,
    #[serde(default)]
    pub reset_required: bool,
}

// ═══════════════════════════════════════════════════════════════════════════
// Node Status / Info
// ═══════════════════════════════════════════════════════════════════════════

/// Live status flags reported by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub initializing: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default)]
    pub errored: bool,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub running_actions: HashSet<String>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub waiting_for_config: HashSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<WorkcellError>,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            ready: true,
            busy: false,
            initializing: false,
            paused: false,
            locked: false,
            stopped: false,
            errored: false,
            running_actions: HashSet::new(),
            waiting_for_config: HashSet::new(),
            errors: Vec::new(),
        }
    }
}

impl NodeStatus {
    /// Whether the scheduler may dispatch a new action to this node.
    pub fn accepting_actions(&self) -> bool {
        self.ready
            && !self.busy
            && !self.locked
            && !self.errored
            && !self.stopped
            && !self.paused
            && !self.initializing
    }

    /// Human-readable summary of the dominant flag.
    pub fn description(&self) -> String {
        if self.errored {
            format!("errored ({} errors)", self.errors.len())
        } else if self.stopped {
            "stopped".to_string()
        } else if self.locked {
            "locked".to_string()
        } else if self.paused {
            "paused".to_string()
        } else if self.initializing {
            "initializing".to_string()
        } else if self.busy {
            format!("busy ({} running)", self.running_actions.len())
        } else if self.ready {
            "ready".to_string()
        } else {
            "not ready".to_string()
        }
    }
}

/// Per-feature capability flags a node client advertises.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeCapabilities {
    #[serde(default)]
    pub get_info: bool,
    #[serde(default)]
    pub get_status: bool,
    #[serde(default)]
    pub get_state: bool,
    #[serde(default)]
    pub send_action: bool,
    #[serde(default)]
    pub get_action_result: bool,
    #[serde(default)]
    pub get_action_history: bool,
    #[serde(default)]
    pub action_files: bool,
    #[serde(default)]
    pub send_admin_commands: bool,
    #[serde(default)]
    pub set_config: bool,
    #[serde(default)]
    pub get_log: bool,
    #[serde(default)]
    pub get_resources: bool,
}

impl NodeCapabilities {
    /// Everything the REST node contract provides.
    pub fn rest_default() -> Self {
        Self {
            get_info: true,
            get_status: true,
            get_state: true,
            send_action: true,
            get_action_result: true,
            get_action_history: true,
            action_files: true,
            send_admin_commands: true,
            set_config: true,
            get_log: true,
            get_resources: false,
        }
    }
}

/// Identity and declared surface of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module_version: String,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
    #[serde(default)]
    pub actions: HashMap<String, ActionDefinition>,
    #[serde(default)]
    pub admin_commands: HashSet<AdminCommand>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config_values: HashMap<String, Value>,
}

impl NodeInfo {
    pub fn new(node_name: impl Into<String>, module_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            node_id: new_ulid(),
            module_name: module_name.into(),
            module_version: String::new(),
            capabilities: NodeCapabilities::default(),
            actions: HashMap::new(),
            admin_commands: HashSet::new(),
            config_values: HashMap::new(),
        }
    }
}

/// A node registry entry held by the workcell manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<NodeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    /// Last successful reachability check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(node_url: impl Into<String>) -> Self {
        Self {
            node_url: node_url.into(),
            info: None,
            status: None,
            last_seen: None,
        }
    }

    pub fn with_info(mut self, info: NodeInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = Some(status);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Locations & Ownership
// ═══════════════════════════════════════════════════════════════════════════

/// A physical location steps may reference instead of a node name. Each
/// node that can interact with the location carries its own representation
/// (e.g. joint angles, deck slot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    #[serde(default = "new_ulid")]
    pub location_id: String,
    pub name: String,
    #[serde(default)]
    pub representations: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

/// Ownership context attached to workflows and forwarded to nodes.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Ownership {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lab_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workcell_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Wire header names (binary action results)
// ═══════════════════════════════════════════════════════════════════════════

/// Header names carrying `ActionResult` metadata when a node answers a
/// `start`/`get_result` call with a binary body instead of JSON.
pub mod headers {
    pub const STATUS: &str = "x-madsci-status";
    pub const ACTION_ID: &str = "x-madsci-action-id";
    pub const ERRORS: &str = "x-madsci-errors";
    pub const FILES: &str = "x-madsci-files";
    pub const DATAPOINTS: &str = "x-madsci-datapoints";
    pub const DATA: &str = "x-madsci-data";
}
