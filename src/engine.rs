//! Workflow execution engine
//!
//! Drives each scheduled step: resolves parameters, dispatches the action
//! against the node, collects results and files, promotes outputs to
//! datapoints, feeds data forward, and advances the workflow's status
//! machine. The engine holds no state between dispatches; everything goes
//! through the state handler.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::clients::{DataClient, Datapoint};
use crate::error::DispatchError;
use crate::node::client::NodeClientFactory;
use crate::params::{feed_data_forward, insert_parameters};
use crate::scheduler::schedule_tick;
use crate::state::StateHandler;
use crate::types::{ActionRequest, ActionResult, ActionStatus, WorkcellError};
use crate::workflow::{Step, Workflow};

/// What a finished dispatch means for the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Advanced,
    Completed,
    Failed,
    Cancelled,
    Requeued,
}

#[derive(Clone)]
pub struct Engine {
    state: Arc<StateHandler>,
    data: Arc<DataClient>,
    clients: Arc<dyn NodeClientFactory>,
    /// Fallback per-step action timeout.
    default_timeout: Duration,
}

impl Engine {
    pub fn new(
        state: Arc<StateHandler>,
        data: Arc<DataClient>,
        clients: Arc<dyn NodeClientFactory>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            state,
            data,
            clients,
            default_timeout,
        }
    }

    pub fn state_handler(&self) -> &Arc<StateHandler> {
        &self.state
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Scheduling entry point
    // ═══════════════════════════════════════════════════════════════════════

    /// One engine tick: ask the scheduler for candidates and dispatch each
    /// on its own task. Returns how many steps were dispatched.
    pub async fn run_next_step(&self) -> usize {
        let candidates = schedule_tick(&self.state).await;
        let mut dispatched = 0;

        for candidate in candidates {
            // At most one in-flight action per node.
            if !self.state.reserve_node(&candidate.node_name).await {
                continue;
            }

            let transitioned = self
                .state
                .update_workflow(&candidate.workflow_id, |wf| {
                    wf.status.initializing = false;
                    wf.status.queued = false;
                    wf.status.running = true;
                    if wf.start_time.is_none() {
                        wf.start_time = Some(Utc::now());
                    }
                })
                .await;
            if transitioned.is_err() {
                self.state.release_node(&candidate.node_name).await;
                continue;
            }

            let engine = self.clone();
            let workflow_id = candidate.workflow_id.clone();
            let node_name = candidate.node_name.clone();
            tokio::spawn(async move {
                engine.run_step(&workflow_id).await;
                engine.state.release_node(&node_name).await;
            });
            dispatched += 1;
        }

        if let Err(e) = self.state.archive_terminal_workflows().await {
            error!("Archival error: {}", e);
        }
        dispatched
    }

    /// The cooperative scheduler/engine loop.
    pub async fn run_loop(self, tick: Duration) {
        let mut ticker = tokio::time::interval(tick);
        loop {
            ticker.tick().await;
            let dispatched = self.run_next_step().await;
            if dispatched > 0 {
                info!("Dispatched {} steps", dispatched);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Step execution
    // ═══════════════════════════════════════════════════════════════════════

    /// Run the current step of a workflow end to end: resolve, dispatch,
    /// collect, finalize. Any dispatch failure is converted into a step
    /// result rather than propagated.
    pub async fn run_step(&self, workflow_id: &str) {
        let outcome = self.run_step_inner(workflow_id).await;
        match outcome {
            Ok(outcome) => {
                info!(workflow_id, ?outcome, "Step finished");
            }
            Err(e) => {
                // Dispatch machinery failed before a result could be
                // recorded; fail the workflow with the typed reason.
                error!(workflow_id, "Step dispatch error: {}", e);
                let envelope = e.to_workcell_error();
                let _ = self
                    .state
                    .update_workflow(workflow_id, |wf| {
                        if let Some(step) = wf.current_step_mut() {
                            step.status = ActionStatus::Failed;
                            let mut result = ActionResult::failed(String::new(), envelope.clone());
                            result.action_id = crate::types::new_ulid();
                            step.result = Some(result);
                        }
                        wf.status.failed = true;
                        wf.status.running = false;
                        wf.status.queued = false;
                        wf.status.description = envelope.message.clone();
                        wf.end_time = Some(Utc::now());
                    })
                    .await;
                let _ = self.state.remove_from_queue(workflow_id).await;
            }
        }
    }

    async fn run_step_inner(&self, workflow_id: &str) -> Result<StepOutcome, DispatchError> {
        // Re-read: the control plane may have flagged the workflow since
        // scheduling.
        let Some(workflow) = self.state.get_workflow(workflow_id).await else {
            return Err(DispatchError::UnknownNode(format!(
                "workflow {} disappeared",
                workflow_id
            )));
        };
        if workflow.status.cancelled {
            return self
                .finalize_cancelled_before_dispatch(workflow_id)
                .await
                .map(|_| StepOutcome::Cancelled);
        }

        let Some(step) = workflow.current_step().cloned() else {
            return Ok(StepOutcome::Completed);
        };

        // Resolve placeholders and location hints.
        let mut resolved = insert_parameters(
            &step,
            &workflow.parameter_values,
            &workflow.file_input_ids,
        )?;
        self.resolve_locations(&mut resolved).await?;

        let node = self
            .state
            .get_node(&resolved.node)
            .await
            .ok_or_else(|| DispatchError::UnknownNode(resolved.node.clone()))?;
        let client = self
            .clients
            .client_for(&resolved.node, &node)
            .await
            .map_err(|source| DispatchError::Transport {
                node: resolved.node.clone(),
                source,
            })?;

        // Build the request, materializing file datapoints to local paths.
        let mut request = ActionRequest::new(&resolved.action);
        request.args = resolved.args.clone();
        for (file_arg, id_or_path) in &resolved.files {
            let path = self.materialize_file(id_or_path).await;
            request.files.insert(file_arg.clone(), path);
        }

        // Record the in-flight step before the node call.
        self.state
            .update_workflow(workflow_id, |wf| {
                if let Some(current) = wf.current_step_mut() {
                    *current = resolved.clone();
                    current.status = ActionStatus::Running;
                }
            })
            .await
            .map_err(|_| DispatchError::UnknownNode(workflow_id.to_string()))?;

        let timeout = resolved
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut result = match client.send_action(&request, true, timeout).await {
            Ok(result) => result,
            Err(send_error) if is_timeout(&send_error) => {
                warn!(
                    workflow_id,
                    action = %resolved.action,
                    "Step timed out after {:?}",
                    timeout
                );
                ActionResult::failed(
                    request.action_id.clone(),
                    WorkcellError::new("StepTimeout", send_error.to_string()),
                )
            }
            Err(send_error) => {
                // One fallback read before declaring the outcome unknown.
                warn!(
                    workflow_id,
                    action = %resolved.action,
                    "send_action failed ({}), attempting get_action_result fallback",
                    send_error
                );
                match client.get_action_result(&request.action_id).await {
                    Ok(result) => result,
                    Err(fallback_error) => ActionResult::unknown(
                        request.action_id.clone(),
                        WorkcellError::new(
                            "ActionResultUnknown",
                            format!(
                                "send_action failed: {}; get_action_result failed: {}",
                                send_error, fallback_error
                            ),
                        ),
                    ),
                }
            }
        };

        // Promote labeled outputs to datapoints.
        let workflow = self
            .state
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| DispatchError::UnknownNode(workflow_id.to_string()))?;
        self.handle_data_and_files(&resolved, &workflow, &mut result)
            .await;

        let mut updated_step = resolved;
        updated_step.status = result.status;
        updated_step.result = Some(result);

        // Cancellation flagged while the call was in flight wins.
        if workflow.status.cancelled {
            updated_step.status = ActionStatus::Cancelled;
        }

        self.finalize_step(workflow_id, updated_step).await
    }

    /// Fill location-hinted args with the location's representation for the
    /// step's node.
    async fn resolve_locations(&self, step: &mut Step) -> Result<(), DispatchError> {
        for (arg, location_name) in step.locations.clone() {
            let Some(location) = self.state.find_location_by_name(&location_name).await else {
                return Err(DispatchError::Transport {
                    node: step.node.clone(),
                    source: anyhow::anyhow!("unknown location {}", location_name),
                });
            };
            let representation = location
                .representations
                .get(&step.node)
                .cloned()
                .unwrap_or_else(|| json!(location.name));
            step.args.insert(arg, representation);
        }
        Ok(())
    }

    /// Turn a file binding (datapoint id or path) into a local path for
    /// upload.
    async fn materialize_file(&self, id_or_path: &str) -> String {
        if tokio::fs::try_exists(id_or_path).await.unwrap_or(false) {
            return id_or_path.to_string();
        }
        match self.data.get_datapoint(id_or_path).await {
            Ok(datapoint) => datapoint.path.unwrap_or_else(|| id_or_path.to_string()),
            Err(_) => id_or_path.to_string(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Result handling
    // ═══════════════════════════════════════════════════════════════════════

    /// Promote node outputs named in `step.data_labels` to datapoints:
    /// JSON outputs as value datapoints, file outputs (that exist on disk)
    /// as file datapoints. The result is updated in place so downstream
    /// feed-forward sees promoted labels.
    pub async fn handle_data_and_files(
        &self,
        step: &Step,
        workflow: &Workflow,
        result: &mut ActionResult,
    ) {
        for (key, label) in &step.data_labels {
            if let Some(value) = result.data.get(key).cloned() {
                let datapoint = Datapoint::value_datapoint(
                    label.clone(),
                    value.clone(),
                    workflow.ownership.clone(),
                );
                match self.data.submit_datapoint(datapoint).await {
                    Ok(id) => {
                        result.datapoints.insert(label.clone(), id);
                        result.data.insert(label.clone(), value);
                    }
                    Err(e) => warn!(label = %label, "Failed to promote value datapoint: {}", e),
                }
            } else if let Some(path) = result.files.get(key).cloned() {
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    warn!(label = %label, path = %path, "File result missing on disk, skipping");
                    continue;
                }
                let datapoint = Datapoint::file_datapoint(
                    label.clone(),
                    path.clone(),
                    workflow.ownership.clone(),
                );
                match self.data.submit_datapoint(datapoint).await {
                    Ok(id) => {
                        result.data.insert(label.clone(), json!(id));
                        result.files.insert(label.clone(), path);
                        result.datapoints.insert(label.clone(), id);
                    }
                    Err(e) => warn!(label = %label, "Failed to promote file datapoint: {}", e),
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Finalization
    // ═══════════════════════════════════════════════════════════════════════

    /// Record a finished step and advance the workflow's status machine
    /// under the per-workflow lock.
    pub async fn finalize_step(
        &self,
        workflow_id: &str,
        updated_step: Step,
    ) -> Result<StepOutcome, DispatchError> {
        let mut outcome = StepOutcome::Failed;
        let updated = self
            .state
            .update_workflow(workflow_id, |wf| {
                let index = wf.status.current_step_index;
                // A cancel flagged while the step was in flight wins over
                // whatever the node reported; at most one terminal flag is
                // ever set.
                let mut updated_step = updated_step;
                if wf.status.cancelled {
                    updated_step.status = ActionStatus::Cancelled;
                }
                if let Some(slot) = wf.steps.get_mut(index) {
                    *slot = updated_step.clone();
                }

                match updated_step.status {
                    ActionStatus::Succeeded => {
                        if let Err(e) = feed_data_forward(wf, index) {
                            wf.status.failed = true;
                            wf.status.running = false;
                            wf.status.queued = false;
                            wf.status.description = e.to_string();
                            wf.end_time = Some(Utc::now());
                            outcome = StepOutcome::Failed;
                            return;
                        }
                        if index + 1 < wf.steps.len() {
                            wf.status.current_step_index = index + 1;
                            wf.status.running = true;
                            outcome = StepOutcome::Advanced;
                        } else {
                            wf.status.completed = true;
                            wf.status.running = false;
                            wf.status.queued = false;
                            wf.end_time = Some(Utc::now());
                            outcome = StepOutcome::Completed;
                        }
                    }
                    ActionStatus::Failed | ActionStatus::Unknown => {
                        wf.status.failed = true;
                        wf.status.running = false;
                        wf.status.queued = false;
                        wf.status.description = updated_step
                            .result
                            .as_ref()
                            .and_then(|r| r.errors.first())
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| format!("step {} failed", updated_step.name));
                        wf.end_time = Some(Utc::now());
                        outcome = StepOutcome::Failed;
                    }
                    ActionStatus::Cancelled => {
                        wf.status.cancelled = true;
                        wf.status.running = false;
                        wf.status.queued = false;
                        wf.end_time = Some(Utc::now());
                        outcome = StepOutcome::Cancelled;
                    }
                    ActionStatus::NotReady => {
                        wf.status.running = false;
                        wf.status.queued = true;
                        wf.scheduler_metadata.ready_to_run = false;
                        wf.scheduler_metadata.reason = updated_step
                            .result
                            .as_ref()
                            .and_then(|r| r.errors.first())
                            .map(|e| e.message.clone())
                            .unwrap_or_else(|| "node not ready".to_string());
                        outcome = StepOutcome::Requeued;
                    }
                    other => {
                        warn!(workflow_id, status = %other, "Unexpected terminal step status");
                        wf.status.failed = true;
                        wf.status.running = false;
                        wf.status.queued = false;
                        wf.end_time = Some(Utc::now());
                        outcome = StepOutcome::Failed;
                    }
                }
            })
            .await
            .map_err(|_| DispatchError::UnknownNode(workflow_id.to_string()))?;

        if updated.status.terminal() {
            let _ = self.state.remove_from_queue(workflow_id).await;
        }
        Ok(outcome)
    }

    async fn finalize_cancelled_before_dispatch(
        &self,
        workflow_id: &str,
    ) -> Result<(), DispatchError> {
        self.state
            .update_workflow(workflow_id, |wf| {
                wf.status.cancelled = true;
                wf.status.running = false;
                wf.status.queued = false;
                if wf.end_time.is_none() {
                    wf.end_time = Some(Utc::now());
                }
            })
            .await
            .map_err(|_| DispatchError::UnknownNode(workflow_id.to_string()))?;
        let _ = self.state.remove_from_queue(workflow_id).await;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Pause a non-terminal workflow. The in-flight step, if any, finishes;
    /// the scheduler stops dispatching new ones.
    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<Workflow, DispatchError> {
        self.state
            .update_workflow(workflow_id, |wf| {
                if !wf.status.terminal() {
                    wf.status.paused = true;
                }
            })
            .await
            .map_err(|_| DispatchError::UnknownNode(workflow_id.to_string()))
    }

    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<Workflow, DispatchError> {
        self.state
            .update_workflow(workflow_id, |wf| {
                wf.status.paused = false;
            })
            .await
            .map_err(|_| DispatchError::UnknownNode(workflow_id.to_string()))
    }

    /// Flag a workflow cancelled. Advisory while a node call is in flight
    /// (that step finalizes as cancelled when it returns); final between
    /// steps.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<Workflow, DispatchError> {
        let updated = self
            .state
            .update_workflow(workflow_id, |wf| {
                if wf.status.terminal() {
                    return;
                }
                wf.status.cancelled = true;
                let in_flight = wf
                    .current_step()
                    .map(|s| s.status == ActionStatus::Running)
                    .unwrap_or(false);
                if !in_flight {
                    wf.status.running = false;
                    wf.status.queued = false;
                    wf.end_time = Some(Utc::now());
                }
            })
            .await
            .map_err(|_| DispatchError::UnknownNode(workflow_id.to_string()))?;
        if updated.status.terminal() {
            let _ = self.state.remove_from_queue(workflow_id).await;
        }
        Ok(updated)
    }

    /// Restart a workflow from step `index`: earlier steps keep their
    /// results, later steps reset to `NOT_STARTED`, and the workflow is
    /// re-enqueued.
    pub async fn retry_workflow(
        &self,
        workflow_id: &str,
        index: usize,
    ) -> Result<Workflow, DispatchError> {
        let updated = self
            .state
            .update_workflow(workflow_id, |wf| {
                let index = index.min(wf.steps.len());
                wf.status.failed = false;
                wf.status.cancelled = false;
                wf.status.completed = false;
                wf.status.running = false;
                wf.status.queued = true;
                wf.status.current_step_index = index;
                wf.status.description.clear();
                wf.end_time = None;
                wf.scheduler_metadata.ready_to_run = false;
                wf.scheduler_metadata.reason.clear();
                for step in wf.steps.iter_mut().skip(index) {
                    step.status = ActionStatus::NotStarted;
                    step.result = None;
                }
            })
            .await
            .map_err(|_| DispatchError::UnknownNode(workflow_id.to_string()))?;
        self.state
            .enqueue_workflow(workflow_id)
            .await
            .map_err(|_| DispatchError::UnknownNode(workflow_id.to_string()))?;
        Ok(updated)
    }
}

/// Whether a transport error is the await-result timeout.
fn is_timeout(error: &anyhow::Error) -> bool {
    error.to_string().contains("TimeoutError")
}

// ═══════════════════════════════════════════════════════════════════════════
// Node status polling
// ═══════════════════════════════════════════════════════════════════════════

/// Periodically refresh every registry entry's status and (on first
/// contact) its info. This is what the scheduler's readiness gate reads.
pub async fn node_poll_loop(
    state: Arc<StateHandler>,
    clients: Arc<dyn NodeClientFactory>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let nodes = state.nodes().await;
        for (name, node) in nodes {
            let client = match clients.client_for(&name, &node).await {
                Ok(client) => client,
                Err(e) => {
                    warn!(node = %name, "No client available: {}", e);
                    continue;
                }
            };
            match client.get_status().await {
                Ok(status) => {
                    let needs_info = node.info.is_none();
                    let info = if needs_info {
                        client.get_info().await.ok()
                    } else {
                        None
                    };
                    let _ = state
                        .update_node(&name, |entry| {
                            entry.status = Some(status);
                            entry.last_seen = Some(Utc::now());
                            if let Some(info) = info {
                                entry.info = Some(info);
                            }
                        })
                        .await;
                }
                Err(e) => {
                    warn!(node = %name, "Status poll failed: {}", e);
                    let _ = state
                        .update_node(&name, |entry| {
                            if let Some(status) = entry.status.as_mut() {
                                status.ready = false;
                            }
                        })
                        .await;
                }
            }
        }
    }
}
