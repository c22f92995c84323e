//! Durable, concurrency-safe store of workcell state
//!
//! The handler is the single source of truth for active workflows, the
//! workflow queue, the node registry, locations, and stored definitions.
//! It understands none of the workflow semantics; it is a transactional
//! key-value store with named collections:
//!
//! - `workflows:active` — active workflows keyed by workflow id
//! - `workflows:archive` — terminal workflows past retention
//! - `workflows:queue`  — FIFO list of workflow ids
//! - `nodes`, `workcell`, `locations`, `definitions`
//!
//! Durability is a JSON snapshot written atomically (tmp + rename) after
//! every mutation. On boot the snapshot is replayed: workflows left
//! `running` by a crash are reset to `queued` and their in-flight steps
//! marked `UNKNOWN` for re-attempt.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::error::StateError;
use crate::types::{ActionStatus, Location, Node};
use crate::workflow::{Workflow, WorkflowDefinition};

// ═══════════════════════════════════════════════════════════════════════════
// Workcell Definition
// ═══════════════════════════════════════════════════════════════════════════

/// Static configuration of the workcell: identity plus the initially known
/// nodes (name → url).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkcellDefinition {
    #[serde(default = "crate::types::new_ulid")]
    pub workcell_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub nodes: HashMap<String, String>,
}

impl WorkcellDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            workcell_id: crate::types::new_ulid(),
            name: name.into(),
            description: String::new(),
            nodes: HashMap::new(),
        }
    }
}

/// Composed view returned by the control plane's `/state` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkcellState {
    pub workflows: HashMap<String, Workflow>,
    pub nodes: HashMap<String, Node>,
    pub locations: Vec<Location>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Snapshot
// ═══════════════════════════════════════════════════════════════════════════

/// The persisted form of the store: every named collection, JSON-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    workcell: WorkcellDefinition,
    #[serde(default)]
    active: HashMap<String, Workflow>,
    #[serde(default)]
    archive: Vec<Workflow>,
    #[serde(default)]
    queue: Vec<String>,
    #[serde(default)]
    nodes: HashMap<String, Node>,
    #[serde(default)]
    locations: HashMap<String, Location>,
    #[serde(default)]
    definitions: HashMap<String, WorkflowDefinition>,
}

impl Snapshot {
    fn new(workcell: WorkcellDefinition) -> Self {
        Self {
            workcell,
            active: HashMap::new(),
            archive: Vec::new(),
            queue: Vec::new(),
            nodes: HashMap::new(),
            locations: HashMap::new(),
            definitions: HashMap::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// State Handler
// ═══════════════════════════════════════════════════════════════════════════

pub struct StateHandler {
    inner: RwLock<Snapshot>,
    /// Per-workflow mutator locks. No two mutators for the same workflow
    /// run concurrently.
    workflow_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Nodes with an in-flight dispatched step. Not persisted.
    reservations: Mutex<std::collections::HashSet<String>>,
    state_path: Option<PathBuf>,
    /// Seconds a terminal workflow stays active before archival.
    retention_secs: i64,
}

impl StateHandler {
    /// Create a handler, replaying the snapshot at `state_path` if one
    /// exists. Crash recovery happens here: `running` workflows go back to
    /// `queued` (step cursor preserved) and steps caught mid-flight are
    /// marked `UNKNOWN`.
    pub fn new(
        workcell: WorkcellDefinition,
        state_path: Option<PathBuf>,
        retention_secs: i64,
    ) -> Result<Self, StateError> {
        let mut snapshot = match &state_path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                let snapshot: Snapshot = serde_json::from_str(&raw)?;
                info!(
                    workflows = snapshot.active.len(),
                    nodes = snapshot.nodes.len(),
                    "Replayed state snapshot from {}",
                    path.display()
                );
                snapshot
            }
            _ => Snapshot::new(workcell),
        };

        let mut recovered = 0;
        for workflow in snapshot.active.values_mut() {
            if workflow.status.running {
                workflow.status.running = false;
                workflow.status.queued = true;
                workflow.scheduler_metadata.ready_to_run = false;
                for step in &mut workflow.steps {
                    if step.status == ActionStatus::Running {
                        step.status = ActionStatus::Unknown;
                    }
                }
                if !snapshot.queue.contains(&workflow.workflow_id) {
                    snapshot.queue.push(workflow.workflow_id.clone());
                }
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!("Requeued {} workflows interrupted by restart", recovered);
        }

        let handler = Self {
            inner: RwLock::new(snapshot),
            workflow_locks: Mutex::new(HashMap::new()),
            reservations: Mutex::new(std::collections::HashSet::new()),
            state_path,
            retention_secs,
        };
        Ok(handler)
    }

    /// In-memory handler for embedding and tests. Terminal workflows stay
    /// readable on the active map for the default retention window.
    pub fn in_memory(workcell: WorkcellDefinition) -> Self {
        Self::new(workcell, None, 300).expect("in-memory handler cannot fail")
    }

    pub async fn workcell(&self) -> WorkcellDefinition {
        self.inner.read().await.workcell.clone()
    }

    /// Write the snapshot atomically. Called by every mutator; failures are
    /// surfaced so callers can decide whether the mutation is safe to trust.
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StateError> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let encoded = serde_json::to_vec_pretty(snapshot)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Workflows
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.inner.read().await.active.get(workflow_id).cloned()
    }

    /// Fetch from the active map, falling back to the archive.
    pub async fn get_workflow_anywhere(&self, workflow_id: &str) -> Option<Workflow> {
        let inner = self.inner.read().await;
        inner.active.get(workflow_id).cloned().or_else(|| {
            inner
                .archive
                .iter()
                .find(|w| w.workflow_id == workflow_id)
                .cloned()
        })
    }

    pub async fn set_active_workflow(&self, workflow: Workflow) -> Result<(), StateError> {
        let mut inner = self.inner.write().await;
        inner.active.insert(workflow.workflow_id.clone(), workflow);
        self.save(&inner).await
    }

    async fn lock_for(&self, workflow_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.workflow_locks.lock().await;
        locks
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Atomic read-modify-write of one workflow under its mutator lock.
    /// Returns the updated workflow.
    pub async fn update_workflow<F>(
        &self,
        workflow_id: &str,
        mutator: F,
    ) -> Result<Workflow, StateError>
    where
        F: FnOnce(&mut Workflow),
    {
        let lock = self.lock_for(workflow_id).await;
        let _guard = lock.lock().await;

        let mut inner = self.inner.write().await;
        let workflow = inner
            .active
            .get_mut(workflow_id)
            .ok_or_else(|| StateError::WorkflowNotFound(workflow_id.to_string()))?;
        mutator(workflow);
        let updated = workflow.clone();
        self.save(&inner).await?;
        Ok(updated)
    }

    pub async fn active_workflows(&self) -> HashMap<String, Workflow> {
        self.inner.read().await.active.clone()
    }

    /// Archived workflows, most recent first.
    pub async fn archived_workflows(&self, number: usize) -> Vec<Workflow> {
        let inner = self.inner.read().await;
        let mut archived: Vec<Workflow> = inner.archive.clone();
        archived.reverse();
        archived.truncate(number);
        archived
    }

    /// Move terminal workflows past the retention window out of the active
    /// map. Runs on the engine tick.
    pub async fn archive_terminal_workflows(&self) -> Result<(), StateError> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .active
            .values()
            .filter(|w| {
                w.status.terminal()
                    && w.end_time
                        .map(|t| (now - t).num_seconds() >= self.retention_secs)
                        .unwrap_or(false)
            })
            .map(|w| w.workflow_id.clone())
            .collect();

        if expired.is_empty() {
            return Ok(());
        }
        for id in &expired {
            if let Some(workflow) = inner.active.remove(id) {
                inner.archive.push(workflow);
            }
            inner.queue.retain(|queued| queued != id);
        }
        info!("Archived {} terminal workflows", expired.len());
        self.save(&inner).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queue
    // ═══════════════════════════════════════════════════════════════════════

    /// Append to the queue if not already present. Order is stable by
    /// enqueue time.
    pub async fn enqueue_workflow(&self, workflow_id: &str) -> Result<(), StateError> {
        let mut inner = self.inner.write().await;
        if !inner.queue.iter().any(|id| id == workflow_id) {
            inner.queue.push(workflow_id.to_string());
        }
        self.save(&inner).await
    }

    pub async fn remove_from_queue(&self, workflow_id: &str) -> Result<(), StateError> {
        let mut inner = self.inner.write().await;
        inner.queue.retain(|id| id != workflow_id);
        self.save(&inner).await
    }

    /// The queued workflows in queue order, skipping ids whose workflow has
    /// been archived out from under the queue.
    pub async fn workflow_queue(&self) -> Vec<Workflow> {
        let inner = self.inner.read().await;
        inner
            .queue
            .iter()
            .filter_map(|id| inner.active.get(id).cloned())
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Node registry
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn nodes(&self) -> HashMap<String, Node> {
        self.inner.read().await.nodes.clone()
    }

    pub async fn get_node(&self, node_name: &str) -> Option<Node> {
        self.inner.read().await.nodes.get(node_name).cloned()
    }

    pub async fn set_node(&self, node_name: &str, node: Node) -> Result<(), StateError> {
        let mut inner = self.inner.write().await;
        inner.nodes.insert(node_name.to_string(), node);
        self.save(&inner).await
    }

    pub async fn update_node<F>(&self, node_name: &str, mutator: F) -> Result<Node, StateError>
    where
        F: FnOnce(&mut Node),
    {
        let mut inner = self.inner.write().await;
        let node = inner
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| StateError::NodeNotFound(node_name.to_string()))?;
        mutator(node);
        let updated = node.clone();
        self.save(&inner).await?;
        Ok(updated)
    }

    /// Reserve a node for a dispatched step. Returns false when the node is
    /// already running one; at most one in-flight action per node.
    pub async fn reserve_node(&self, node_name: &str) -> bool {
        self.reservations.lock().await.insert(node_name.to_string())
    }

    pub async fn release_node(&self, node_name: &str) {
        self.reservations.lock().await.remove(node_name);
    }

    pub async fn is_node_reserved(&self, node_name: &str) -> bool {
        self.reservations.lock().await.contains(node_name)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Locations
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn locations(&self) -> Vec<Location> {
        let mut locations: Vec<Location> = self.inner.read().await.locations.values().cloned().collect();
        locations.sort_by(|a, b| a.location_id.cmp(&b.location_id));
        locations
    }

    pub async fn get_location(&self, location_id: &str) -> Option<Location> {
        self.inner.read().await.locations.get(location_id).cloned()
    }

    /// Look a location up by name, the form steps reference.
    pub async fn find_location_by_name(&self, name: &str) -> Option<Location> {
        self.inner
            .read()
            .await
            .locations
            .values()
            .find(|l| l.name == name)
            .cloned()
    }

    pub async fn set_location(&self, location: Location) -> Result<(), StateError> {
        let mut inner = self.inner.write().await;
        inner
            .locations
            .insert(location.location_id.clone(), location);
        self.save(&inner).await
    }

    pub async fn delete_location(&self, location_id: &str) -> Result<(), StateError> {
        let mut inner = self.inner.write().await;
        inner
            .locations
            .remove(location_id)
            .ok_or_else(|| StateError::LocationNotFound(location_id.to_string()))?;
        self.save(&inner).await
    }

    pub async fn attach_resource(
        &self,
        location_id: &str,
        resource_id: &str,
    ) -> Result<Location, StateError> {
        let mut inner = self.inner.write().await;
        let location = inner
            .locations
            .get_mut(location_id)
            .ok_or_else(|| StateError::LocationNotFound(location_id.to_string()))?;
        location.resource_id = Some(resource_id.to_string());
        let updated = location.clone();
        self.save(&inner).await?;
        Ok(updated)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Workflow definitions
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn store_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<String, StateError> {
        let id = definition.workflow_definition_id.clone();
        let mut inner = self.inner.write().await;
        inner.definitions.insert(id.clone(), definition);
        self.save(&inner).await?;
        Ok(id)
    }

    pub async fn get_definition(&self, definition_id: &str) -> Option<WorkflowDefinition> {
        self.inner
            .read()
            .await
            .definitions
            .get(definition_id)
            .cloned()
    }

    pub async fn definition_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().await.definitions.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Composed state
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn composed_state(&self) -> WorkcellState {
        let inner = self.inner.read().await;
        let mut locations: Vec<Location> = inner.locations.values().cloned().collect();
        locations.sort_by(|a, b| a.location_id.cmp(&b.location_id));
        WorkcellState {
            workflows: inner.active.clone(),
            nodes: inner.nodes.clone(),
            locations,
        }
    }

}
