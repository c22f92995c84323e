//! Workflow data model
//!
//! Workflows are materialized from a `WorkflowDefinition` plus user inputs,
//! then driven through their status machine by the engine. Steps are mutated
//! only by the engine and never deleted; the full history stays on the
//! workflow record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{new_ulid, ActionResult, ActionStatus, Ownership};

// ═══════════════════════════════════════════════════════════════════════════
// Parameter Specs
// ═══════════════════════════════════════════════════════════════════════════

/// A declared JSON input of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonInput {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

/// A declared file input of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInput {
    pub key: String,
    #[serde(default)]
    pub required: bool,
}

/// Reference to the upstream step a feed-forward value comes from: either a
/// 0-based index or a user-supplied step key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StepRef {
    Index(usize),
    Key(String),
}

impl StepRef {
    /// Whether this reference matches a completed step at `index` with the
    /// given optional key.
    pub fn matches(&self, index: usize, key: Option<&str>) -> bool {
        match self {
            StepRef::Index(i) => *i == index,
            StepRef::Key(k) => Some(k.as_str()) == key,
        }
    }
}

/// What kind of value a feed-forward binding carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeedForwardType {
    #[default]
    Json,
    File,
}

/// Binding of a later step's parameter to an earlier step's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedForward {
    pub key: String,
    pub step: StepRef,
    /// Datapoint label to pick from the upstream step's result. If omitted,
    /// the upstream step must produce exactly one datapoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub data_type: FeedForwardType,
}

/// The full parameter spec of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowParameters {
    #[serde(default)]
    pub json_inputs: Vec<JsonInput>,
    #[serde(default)]
    pub file_inputs: Vec<FileInput>,
    #[serde(default)]
    pub feed_forward: Vec<FeedForward>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Steps
// ═══════════════════════════════════════════════════════════════════════════

/// Placeholders to fill from parameter bindings just before dispatch.
/// Each map entry is `target field → parameter key`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepParameters {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub files: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl StepParameters {
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.files.is_empty() && self.node.is_none() && self.action.is_none()
    }
}

/// Guard predicate evaluated by the scheduler before dispatching a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum Condition {
    /// The named node must currently accept actions.
    NodeReady { node: String },
    /// A bound parameter value must equal the given JSON value.
    ParameterEquals { key: String, value: Value },
}

/// One action invocation within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    #[serde(default = "new_ulid")]
    pub step_id: String,
    /// Optional user-supplied stable name, referenced by feed-forward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub name: String,
    /// Node name resolved against the registry at dispatch time.
    pub node: String,
    pub action: String,
    #[serde(default)]
    pub args: HashMap<String, Value>,
    /// File arguments: argument name → datapoint id or staged path.
    #[serde(default)]
    pub files: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_parameters: Option<StepParameters>,
    /// Node result keys to promote to datapoints: result key → label.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data_labels: HashMap<String, String>,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Physical binding hints: argument name → location name. The engine
    /// substitutes the location's representation for the step's node.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub locations: HashMap<String, String>,
    /// Per-step action timeout in seconds; falls back to the workcell
    /// default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Workflow Status
// ═══════════════════════════════════════════════════════════════════════════

/// Orthogonal status flags plus the step cursor.
///
/// Derivations: `active = queued ∨ running`,
/// `terminal = completed ∨ failed ∨ cancelled`. At most one of
/// `{completed, failed, cancelled}` is ever set.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowStatus {
    #[serde(default)]
    pub initializing: bool,
    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub current_step_index: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl WorkflowStatus {
    pub fn active(&self) -> bool {
        self.queued || self.running
    }

    pub fn terminal(&self) -> bool {
        self.completed || self.failed || self.cancelled
    }

    /// The dominant flag, for display.
    pub fn dominant(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.failed {
            "failed"
        } else if self.completed {
            "completed"
        } else if self.paused {
            "paused"
        } else if self.running {
            "running"
        } else if self.queued {
            "queued"
        } else {
            "initializing"
        }
    }
}

/// Scratch area holding the scheduler's readiness decision and rationale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerMetadata {
    #[serde(default)]
    pub ready_to_run: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl Default for SchedulerMetadata {
    fn default() -> Self {
        Self {
            ready_to_run: false,
            priority: 0,
            reason: String::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Workflow
// ═══════════════════════════════════════════════════════════════════════════

/// An ordered sequence of steps with shared parameters and feed-forward
/// data, plus its scheduling state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "new_ulid")]
    pub workflow_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workflow_definition_id: String,
    #[serde(default)]
    pub parameters: WorkflowParameters,
    /// Runtime JSON bindings: parameter key → value.
    #[serde(default)]
    pub parameter_values: HashMap<String, Value>,
    /// Uploaded or feed-forwarded files: parameter key → datapoint id.
    #[serde(default)]
    pub file_input_ids: HashMap<String, String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub scheduler_metadata: SchedulerMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ownership: Ownership,
}

impl Workflow {
    /// Materialize a workflow from a definition. Steps are copied with
    /// fresh ids; the workflow starts `initializing` at step 0 and is
    /// enqueued by the control plane after parameter binding.
    pub fn from_definition(definition: &WorkflowDefinition, ownership: Ownership) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|s| Step {
                step_id: new_ulid(),
                key: s.key.clone(),
                name: s.name.clone(),
                node: s.node.clone(),
                action: s.action.clone(),
                args: s.args.clone(),
                files: s.files.clone(),
                use_parameters: s.use_parameters.clone(),
                data_labels: s.data_labels.clone(),
                status: ActionStatus::NotStarted,
                result: None,
                conditions: s.conditions.clone(),
                locations: s.locations.clone(),
                timeout: s.timeout,
            })
            .collect();

        Self {
            workflow_id: new_ulid(),
            name: definition.name.clone(),
            workflow_definition_id: definition.workflow_definition_id.clone(),
            parameters: definition.parameters.clone(),
            parameter_values: HashMap::new(),
            file_input_ids: HashMap::new(),
            steps,
            status: WorkflowStatus {
                initializing: true,
                ..Default::default()
            },
            scheduler_metadata: SchedulerMetadata::default(),
            start_time: None,
            end_time: None,
            submitted_time: None,
            ownership,
        }
    }

    /// The step the cursor points at, if any remain.
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.status.current_step_index)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut Step> {
        self.steps.get_mut(self.status.current_step_index)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Workflow Definition
// ═══════════════════════════════════════════════════════════════════════════

/// A step template inside a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub node: String,
    pub action: String,
    #[serde(default)]
    pub args: HashMap<String, Value>,
    #[serde(default)]
    pub files: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data_labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_parameters: Option<StepParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub locations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// A reusable, parameterized workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "new_ulid")]
    pub workflow_definition_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub parameters: WorkflowParameters,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Parse a definition from its on-disk YAML form.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}
