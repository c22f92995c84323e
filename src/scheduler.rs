//! Step scheduler
//!
//! Runs as part of the engine's cooperative loop. Each tick snapshots the
//! queue and node registry, decides which workflows are ready to run, and
//! returns the dispatch candidates in priority order. All state changes go
//! through the state handler; the decision itself is a pure function of
//! the snapshots.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::params::resolve_step_node;
use crate::state::StateHandler;
use crate::types::{ActionStatus, Node};
use crate::workflow::{Condition, Workflow};

/// A workflow the scheduler has cleared for dispatch this tick.
#[derive(Debug, Clone)]
pub struct ScheduledWorkflow {
    pub workflow_id: String,
    /// The resolved node the current step will run on.
    pub node_name: String,
}

/// Evaluate one scheduler tick.
///
/// Walks the queue in order, gates each workflow on node readiness and
/// step conditions, records the readiness decision (and its reason) on the
/// workflow, and returns ready workflows sorted by priority (descending)
/// then submitted time (ascending) — at most one per node.
pub async fn schedule_tick(state: &StateHandler) -> Vec<ScheduledWorkflow> {
    let queue = state.workflow_queue().await;
    let nodes = state.nodes().await;

    let mut ready: Vec<(Workflow, String)> = Vec::new();

    for workflow in queue {
        if workflow.status.paused || workflow.status.terminal() {
            continue;
        }
        let Some(step) = workflow.current_step() else {
            continue;
        };
        // A step already in flight keeps its workflow off this tick.
        if step.status == ActionStatus::Running {
            continue;
        }

        let node_name = match resolve_step_node(step, &workflow.parameter_values) {
            Ok(name) => name,
            Err(err) => {
                mark_not_ready(state, &workflow.workflow_id, err.to_string()).await;
                continue;
            }
        };

        let Some(node) = nodes.get(&node_name) else {
            // Unknown node is terminal: the registry was consulted and the
            // step can never dispatch.
            let reason = format!("unknown node {}", node_name);
            warn!(
                workflow_id = %workflow.workflow_id,
                node = %node_name,
                "Failing workflow: node not in registry"
            );
            let _ = state
                .update_workflow(&workflow.workflow_id, |wf| {
                    wf.status.failed = true;
                    wf.status.queued = false;
                    wf.status.running = false;
                    wf.status.description = reason.clone();
                    wf.end_time = Some(chrono::Utc::now());
                    wf.scheduler_metadata.ready_to_run = false;
                    wf.scheduler_metadata.reason = reason.clone();
                })
                .await;
            let _ = state.remove_from_queue(&workflow.workflow_id).await;
            continue;
        };

        if let Some(reason) = node_obstacle(&node_name, node, state).await {
            mark_not_ready(state, &workflow.workflow_id, reason).await;
            continue;
        }

        if let Some(reason) = unmet_condition(&workflow, &nodes) {
            mark_not_ready(state, &workflow.workflow_id, reason).await;
            continue;
        }

        ready.push((workflow, node_name));
    }

    // Priority descending, then submitted time ascending.
    ready.sort_by(|(a, _), (b, _)| {
        b.scheduler_metadata
            .priority
            .cmp(&a.scheduler_metadata.priority)
            .then_with(|| a.submitted_time.cmp(&b.submitted_time))
    });

    // One dispatch per node per tick.
    let mut claimed: HashSet<String> = HashSet::new();
    let mut scheduled = Vec::new();
    for (workflow, node_name) in ready {
        if !claimed.insert(node_name.clone()) {
            continue;
        }
        let _ = state
            .update_workflow(&workflow.workflow_id, |wf| {
                wf.scheduler_metadata.ready_to_run = true;
                wf.scheduler_metadata.reason = format!("dispatching to {}", node_name);
            })
            .await;
        scheduled.push(ScheduledWorkflow {
            workflow_id: workflow.workflow_id,
            node_name,
        });
    }
    scheduled
}

async fn mark_not_ready(state: &StateHandler, workflow_id: &str, reason: String) {
    let _ = state
        .update_workflow(workflow_id, |wf| {
            wf.scheduler_metadata.ready_to_run = false;
            wf.scheduler_metadata.reason = reason;
        })
        .await;
}

/// Why a node cannot take a new action right now, if anything.
async fn node_obstacle(node_name: &str, node: &Node, state: &StateHandler) -> Option<String> {
    if state.is_node_reserved(node_name).await {
        return Some(format!("node {} has a step in flight", node_name));
    }
    match &node.status {
        Some(status) if status.accepting_actions() => None,
        Some(status) => Some(format!("node {} is {}", node_name, status.description())),
        None => Some(format!("node {} has not reported status", node_name)),
    }
}

/// First unmet condition on the current step, if any.
fn unmet_condition(workflow: &Workflow, nodes: &HashMap<String, Node>) -> Option<String> {
    let step = workflow.current_step()?;
    for condition in &step.conditions {
        match condition {
            Condition::NodeReady { node } => {
                let ok = nodes
                    .get(node)
                    .and_then(|n| n.status.as_ref())
                    .map(|s| s.accepting_actions())
                    .unwrap_or(false);
                if !ok {
                    return Some(format!("condition unmet: node {} not ready", node));
                }
            }
            Condition::ParameterEquals { key, value } => {
                if workflow.parameter_values.get(key) != Some(value) {
                    return Some(format!("condition unmet: parameter {} != expected", key));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkcellDefinition;
    use crate::types::{Node, NodeStatus};
    use crate::workflow::{Step, Workflow, WorkflowDefinition};
    use std::collections::HashMap as Map;

    fn workflow_with_step(node: &str, priority: i64) -> Workflow {
        let mut wf = Workflow::from_definition(
            &WorkflowDefinition {
                workflow_definition_id: crate::types::new_ulid(),
                name: "wf".into(),
                metadata: None,
                parameters: Default::default(),
                steps: vec![],
            },
            Default::default(),
        );
        wf.steps = vec![Step {
            step_id: crate::types::new_ulid(),
            key: None,
            name: "s".into(),
            node: node.into(),
            action: "a".into(),
            args: Map::new(),
            files: Map::new(),
            use_parameters: None,
            data_labels: Map::new(),
            status: Default::default(),
            result: None,
            conditions: vec![],
            locations: Map::new(),
            timeout: None,
        }];
        wf.status.initializing = false;
        wf.status.queued = true;
        wf.submitted_time = Some(chrono::Utc::now());
        wf.scheduler_metadata.priority = priority;
        wf
    }

    #[tokio::test]
    async fn priority_wins_then_fifo() {
        let state = StateHandler::in_memory(WorkcellDefinition::new("test"));
        state
            .set_node("n1", Node::new("http://n1").with_status(NodeStatus::default()))
            .await
            .unwrap();

        let low = workflow_with_step("n1", 0);
        let high = workflow_with_step("n1", 5);
        state.set_active_workflow(low.clone()).await.unwrap();
        state.set_active_workflow(high.clone()).await.unwrap();
        state.enqueue_workflow(&low.workflow_id).await.unwrap();
        state.enqueue_workflow(&high.workflow_id).await.unwrap();

        let scheduled = schedule_tick(&state).await;
        // One per node: only the high-priority workflow dispatches.
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].workflow_id, high.workflow_id);

        let low_after = state.get_workflow(&low.workflow_id).await.unwrap();
        assert!(!low_after.scheduler_metadata.ready_to_run);
    }

    #[tokio::test]
    async fn unknown_node_fails_workflow_on_tick() {
        let state = StateHandler::in_memory(WorkcellDefinition::new("test"));
        let wf = workflow_with_step("ghost", 0);
        state.set_active_workflow(wf.clone()).await.unwrap();
        state.enqueue_workflow(&wf.workflow_id).await.unwrap();

        let scheduled = schedule_tick(&state).await;
        assert!(scheduled.is_empty());

        let after = state.get_workflow(&wf.workflow_id).await.unwrap();
        assert!(after.status.failed);
        assert!(after.end_time.is_some());
        assert!(after.scheduler_metadata.reason.contains("unknown node"));
    }

    #[tokio::test]
    async fn busy_node_defers_with_reason() {
        let state = StateHandler::in_memory(WorkcellDefinition::new("test"));
        let busy = NodeStatus {
            busy: true,
            ..Default::default()
        };
        state
            .set_node("n1", Node::new("http://n1").with_status(busy))
            .await
            .unwrap();

        let wf = workflow_with_step("n1", 0);
        state.set_active_workflow(wf.clone()).await.unwrap();
        state.enqueue_workflow(&wf.workflow_id).await.unwrap();

        assert!(schedule_tick(&state).await.is_empty());
        let after = state.get_workflow(&wf.workflow_id).await.unwrap();
        assert!(!after.status.terminal());
        assert!(after.scheduler_metadata.reason.contains("busy"));
    }
}
