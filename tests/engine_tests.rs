//! Engine scenarios: dispatch, feed-forward, fallback, cancel, retry.

mod common;

use std::collections::HashMap;

use common::*;
use serde_json::json;
use workcelld::types::{ActionResult, ActionStatus, Node, NodeStatus, WorkcellError};
use workcelld::workflow::{FeedForward, StepParameters, StepRef};

// ═══════════════════════════════════════════════════════════════════════════
// S1: single-step success
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn single_step_success() {
    let h = harness();
    ready_node(&h, "n1").await;
    let wf = submit(&h, "single", vec![step("Only", "n1", "a")]).await;

    let dispatched = h.engine.run_next_step().await;
    assert_eq!(dispatched, 1);

    let done = wait_for(&h, &wf.workflow_id, |w| w.status.terminal()).await;
    assert!(done.status.completed);
    assert!(!done.status.running);
    assert_eq!(done.steps[0].status, ActionStatus::Succeeded);
    assert_eq!(
        done.steps[0].result.as_ref().unwrap().status,
        ActionStatus::Succeeded
    );
    // The cursor stays on the step that completed the workflow.
    assert_eq!(done.status.current_step_index, 0);
    assert!(done.end_time.is_some());
    assert!(done.start_time.is_some());

    // Repeated queries return the same record.
    let again = h.state.get_workflow(&wf.workflow_id).await.unwrap();
    assert_eq!(again.end_time, done.end_time);
    assert_eq!(again.steps[0].step_id, done.steps[0].step_id);
}

// ═══════════════════════════════════════════════════════════════════════════
// S2: two-step with feed-forward
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn feed_forward_binds_downstream_args() {
    let h = harness();
    ready_node(&h, "n1").await;

    let mut producer = step("Produce", "n1", "measure");
    producer.data_labels = HashMap::from([("out".to_string(), "out".to_string())]);
    let mut consumer = step("Consume", "n1", "record");
    consumer.use_parameters = Some(StepParameters {
        args: HashMap::from([("x".to_string(), "x".to_string())]),
        ..Default::default()
    });

    let mut wf = submit(&h, "feed-forward", vec![producer, consumer]).await;
    wf.parameters.feed_forward = vec![FeedForward {
        key: "x".to_string(),
        step: StepRef::Index(0),
        label: Some("out".to_string()),
        data_type: Default::default(),
    }];
    h.state.set_active_workflow(wf.clone()).await.unwrap();

    h.client
        .script_send(Ok(
            ActionResult::succeeded("").with_data("out", json!(42))
        ))
        .await;

    h.engine.run_next_step().await;
    wait_for(&h, &wf.workflow_id, |w| w.status.current_step_index == 1).await;

    h.engine.run_next_step().await;
    let done = wait_for(&h, &wf.workflow_id, |w| w.status.terminal()).await;

    assert!(done.status.completed);
    assert_eq!(done.parameter_values["x"], json!(42));
    assert_eq!(done.steps[1].args["x"], json!(42));

    let requests = h.client.recorded_requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].args["x"], json!(42));
}

// ═══════════════════════════════════════════════════════════════════════════
// S3: node becomes ready mid-queue
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn node_becoming_ready_unblocks_queued_workflow() {
    let h = harness();
    let not_ready = NodeStatus {
        ready: false,
        ..Default::default()
    };
    h.state
        .set_node("n1", Node::new("http://n1").with_status(not_ready))
        .await
        .unwrap();
    ready_node(&h, "n2").await;

    let w1 = submit(&h, "blocked", vec![step("S", "n1", "a")]).await;
    let w2 = submit(&h, "runnable", vec![step("S", "n2", "a")]).await;

    h.engine.run_next_step().await;
    let w2_done = wait_for(&h, &w2.workflow_id, |w| w.status.terminal()).await;
    assert!(w2_done.status.completed);

    let w1_waiting = h.state.get_workflow(&w1.workflow_id).await.unwrap();
    assert!(w1_waiting.status.queued);
    assert!(!w1_waiting.scheduler_metadata.ready_to_run);
    assert!(!w1_waiting.scheduler_metadata.reason.is_empty());

    // Node n1 comes up; the next tick dispatches W1.
    ready_node(&h, "n1").await;
    h.engine.run_next_step().await;
    let w1_done = wait_for(&h, &w1.workflow_id, |w| w.status.terminal()).await;
    assert!(w1_done.status.completed);
}

// ═══════════════════════════════════════════════════════════════════════════
// S4: dispatch exception with successful fallback
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn send_action_failure_recovers_through_fallback() {
    let h = harness();
    ready_node(&h, "n1").await;
    let wf = submit(&h, "fallback", vec![step("S", "n1", "a")]).await;

    h.client
        .script_send(Err("connection reset by peer".to_string()))
        .await;
    h.client
        .script_fallback(Ok(ActionResult::succeeded("")))
        .await;

    h.engine.run_next_step().await;
    let done = wait_for(&h, &wf.workflow_id, |w| w.status.terminal()).await;
    assert!(done.status.completed);
    assert_eq!(done.steps[0].status, ActionStatus::Succeeded);
}

#[tokio::test]
async fn send_and_fallback_failure_yields_unknown_step() {
    let h = harness();
    ready_node(&h, "n1").await;
    let wf = submit(&h, "unknown", vec![step("S", "n1", "a")]).await;

    h.client
        .script_send(Err("connection reset by peer".to_string()))
        .await;
    h.client
        .script_fallback(Err("still unreachable".to_string()))
        .await;

    h.engine.run_next_step().await;
    let done = wait_for(&h, &wf.workflow_id, |w| w.status.terminal()).await;
    assert!(done.status.failed);
    assert_eq!(done.steps[0].status, ActionStatus::Unknown);
    let errors = &done.steps[0].result.as_ref().unwrap().errors;
    assert_eq!(errors[0].error_type, "ActionResultUnknown");
}

#[tokio::test]
async fn step_timeout_fails_workflow_with_typed_error() {
    let h = harness();
    ready_node(&h, "n1").await;
    let wf = submit(&h, "timeout", vec![step("S", "n1", "a")]).await;

    h.client
        .script_send(Err("TimeoutError: action timed out".to_string()))
        .await;

    h.engine.run_next_step().await;
    let done = wait_for(&h, &wf.workflow_id, |w| w.status.terminal()).await;
    assert!(done.status.failed);
    let errors = &done.steps[0].result.as_ref().unwrap().errors;
    assert_eq!(errors[0].error_type, "StepTimeout");
}

// ═══════════════════════════════════════════════════════════════════════════
// S5: cancel mid-workflow
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn cancel_between_steps_is_final() {
    let h = harness();
    ready_node(&h, "n1").await;
    let wf = submit(
        &h,
        "cancel",
        vec![
            step("One", "n1", "a"),
            step("Two", "n1", "a"),
            step("Three", "n1", "a"),
        ],
    )
    .await;

    h.engine.run_next_step().await;
    wait_for(&h, &wf.workflow_id, |w| w.status.current_step_index == 1).await;

    h.engine.cancel_workflow(&wf.workflow_id).await.unwrap();

    // The scheduler observes the flag before dispatching step 1.
    h.engine.run_next_step().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let done = h.state.get_workflow(&wf.workflow_id).await.unwrap();
    assert!(done.status.cancelled);
    assert!(done.status.terminal());
    assert_eq!(done.status.current_step_index, 1);
    assert_eq!(done.steps[0].status, ActionStatus::Succeeded);
    assert_eq!(done.steps[1].status, ActionStatus::NotStarted);
    assert!(done.end_time.is_some());
}

// ═══════════════════════════════════════════════════════════════════════════
// S6: retry from a failed step
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn retry_restores_suffix_and_reruns() {
    let h = harness();
    ready_node(&h, "n1").await;
    let wf = submit(
        &h,
        "retry",
        vec![
            step("One", "n1", "a"),
            step("Two", "n1", "a"),
            step("Three", "n1", "a"),
        ],
    )
    .await;

    h.client.script_send(Ok(ActionResult::succeeded(""))).await;
    h.client
        .script_send(Ok(ActionResult::failed(
            "",
            WorkcellError::new("ActionFailed", "instrument jam"),
        )))
        .await;

    h.engine.run_next_step().await;
    wait_for(&h, &wf.workflow_id, |w| w.status.current_step_index == 1).await;
    h.engine.run_next_step().await;
    let failed = wait_for(&h, &wf.workflow_id, |w| w.status.terminal()).await;
    assert!(failed.status.failed);
    assert_eq!(failed.status.current_step_index, 1);
    let first_result = failed.steps[0].result.clone().unwrap();

    let retried = h.engine.retry_workflow(&wf.workflow_id, 1).await.unwrap();
    assert!(!retried.status.terminal());
    assert!(retried.status.queued);
    assert!(retried.end_time.is_none());
    assert_eq!(retried.status.current_step_index, 1);
    assert_eq!(retried.steps[0].status, ActionStatus::Succeeded);
    assert_eq!(
        retried.steps[0].result.as_ref().unwrap().action_id,
        first_result.action_id
    );
    assert_eq!(retried.steps[1].status, ActionStatus::NotStarted);
    assert!(retried.steps[1].result.is_none());
    assert_eq!(retried.steps[2].status, ActionStatus::NotStarted);

    // Unscripted sends succeed: drive the rest of the workflow home.
    h.engine.run_next_step().await;
    wait_for(&h, &wf.workflow_id, |w| w.status.current_step_index == 2).await;
    h.engine.run_next_step().await;
    let done = wait_for(&h, &wf.workflow_id, |w| w.status.terminal()).await;
    assert!(done.status.completed);
}

// ═══════════════════════════════════════════════════════════════════════════
// Pause / resume round-trip
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn pause_resume_preserves_progress() {
    let h = harness();
    ready_node(&h, "n1").await;
    let wf = submit(
        &h,
        "pausable",
        vec![step("One", "n1", "a"), step("Two", "n1", "a")],
    )
    .await;

    h.engine.run_next_step().await;
    wait_for(&h, &wf.workflow_id, |w| w.status.current_step_index == 1).await;

    let paused = h.engine.pause_workflow(&wf.workflow_id).await.unwrap();
    assert!(paused.status.paused);
    let first_result = paused.steps[0].result.clone().unwrap();

    // Paused workflows are skipped by the scheduler.
    assert_eq!(h.engine.run_next_step().await, 0);
    let still = h.state.get_workflow(&wf.workflow_id).await.unwrap();
    assert_eq!(still.status.current_step_index, 1);
    assert_eq!(
        still.steps[0].result.as_ref().unwrap().action_id,
        first_result.action_id
    );

    h.engine.resume_workflow(&wf.workflow_id).await.unwrap();
    h.engine.run_next_step().await;
    let done = wait_for(&h, &wf.workflow_id, |w| w.status.terminal()).await;
    assert!(done.status.completed);
    assert_eq!(
        done.steps[0].result.as_ref().unwrap().action_id,
        first_result.action_id
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Datapoint promotion
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn labeled_outputs_become_datapoints() {
    let h = harness();
    ready_node(&h, "n1").await;

    let mut measured = step("Measure", "n1", "read");
    measured.data_labels = HashMap::from([("reading".to_string(), "absorbance".to_string())]);
    let wf = submit(&h, "promote", vec![measured]).await;

    h.client
        .script_send(Ok(
            ActionResult::succeeded("").with_data("reading", json!(0.42))
        ))
        .await;

    h.engine.run_next_step().await;
    let done = wait_for(&h, &wf.workflow_id, |w| w.status.terminal()).await;
    assert!(done.status.completed);

    let result = done.steps[0].result.as_ref().unwrap();
    assert!(result.datapoints.contains_key("absorbance"));
    assert_eq!(result.data["absorbance"], json!(0.42));
}
