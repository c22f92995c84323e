//! Parameter resolution
//!
//! Runs at two moments: once at submission to bind user-supplied values and
//! files against the declared inputs, and once just before each step
//! dispatch to substitute placeholders. Feed-forward values are applied a
//! third way: right after an upstream step completes, its promoted
//! datapoints are bound into the workflow's parameter maps for downstream
//! steps.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{ResolutionError, ValidationError};
use crate::workflow::{FeedForwardType, Step, Workflow, WorkflowParameters};

// ═══════════════════════════════════════════════════════════════════════════
// Submission-time binding
// ═══════════════════════════════════════════════════════════════════════════

/// Validate a submission's inputs against the declared parameter spec.
///
/// Rejects user bindings that collide with feed-forward targets, missing
/// required values/files, and feed-forward references to steps that do not
/// exist.
pub fn validate_inputs(
    parameters: &WorkflowParameters,
    json_values: &HashMap<String, Value>,
    file_keys: &[String],
    step_count: usize,
    step_keys: &[Option<String>],
) -> Result<(), ValidationError> {
    for ff in &parameters.feed_forward {
        if json_values.contains_key(&ff.key) || file_keys.contains(&ff.key) {
            return Err(ValidationError::FeedForwardConflict(ff.key.clone()));
        }
        let known = match &ff.step {
            crate::workflow::StepRef::Index(i) => *i < step_count,
            crate::workflow::StepRef::Key(k) => {
                step_keys.iter().any(|key| key.as_deref() == Some(k))
            }
        };
        if !known {
            return Err(ValidationError::UnknownStep {
                key: ff.key.clone(),
                step: match &ff.step {
                    crate::workflow::StepRef::Index(i) => i.to_string(),
                    crate::workflow::StepRef::Key(k) => k.clone(),
                },
            });
        }
    }

    for input in &parameters.json_inputs {
        if input.required && input.default.is_none() && !json_values.contains_key(&input.key) {
            return Err(ValidationError::MissingInput(input.key.clone()));
        }
    }

    for input in &parameters.file_inputs {
        if input.required && !file_keys.contains(&input.key) {
            return Err(ValidationError::MissingFile(input.key.clone()));
        }
    }

    Ok(())
}

/// Bind submitted values and uploaded file ids onto the workflow. Defaults
/// are applied for absent optional inputs. Assumes `validate_inputs` has
/// already accepted the submission.
pub fn bind_inputs(
    workflow: &mut Workflow,
    json_values: HashMap<String, Value>,
    file_ids: HashMap<String, String>,
) {
    for input in &workflow.parameters.json_inputs {
        if let Some(default) = &input.default {
            workflow
                .parameter_values
                .entry(input.key.clone())
                .or_insert_with(|| default.clone());
        }
    }
    workflow.parameter_values.extend(json_values);
    workflow.file_input_ids.extend(file_ids);
}

// ═══════════════════════════════════════════════════════════════════════════
// Dispatch-time substitution
// ═══════════════════════════════════════════════════════════════════════════

/// Substitute a step's placeholders from the current bindings, returning
/// the resolved copy dispatched to the node. Substitution is whole-value:
/// the bound JSON value replaces the arg regardless of its type.
pub fn insert_parameters(
    step: &Step,
    parameter_values: &HashMap<String, Value>,
    file_input_ids: &HashMap<String, String>,
) -> Result<Step, ResolutionError> {
    let mut resolved = step.clone();
    let Some(use_parameters) = &step.use_parameters else {
        return Ok(resolved);
    };

    for (arg_name, param_key) in &use_parameters.args {
        let value = parameter_values
            .get(param_key)
            .ok_or_else(|| ResolutionError::Unbound(param_key.clone()))?;
        resolved.args.insert(arg_name.clone(), value.clone());
    }

    for (file_arg, param_key) in &use_parameters.files {
        let id = file_input_ids
            .get(param_key)
            .ok_or_else(|| ResolutionError::Unbound(param_key.clone()))?;
        resolved.files.insert(file_arg.clone(), id.clone());
    }

    if let Some(param_key) = &use_parameters.node {
        match parameter_values.get(param_key) {
            Some(Value::String(node)) => resolved.node = node.clone(),
            Some(_) | None => return Err(ResolutionError::Unbound(param_key.clone())),
        }
    }

    if let Some(param_key) = &use_parameters.action {
        match parameter_values.get(param_key) {
            Some(Value::String(action)) => resolved.action = action.clone(),
            Some(_) | None => return Err(ResolutionError::Unbound(param_key.clone())),
        }
    }

    Ok(resolved)
}

/// The node name a step will dispatch to, after placeholder expansion.
/// Used by the scheduler, which must not mutate the step.
pub fn resolve_step_node(
    step: &Step,
    parameter_values: &HashMap<String, Value>,
) -> Result<String, ResolutionError> {
    if let Some(use_parameters) = &step.use_parameters {
        if let Some(param_key) = &use_parameters.node {
            return match parameter_values.get(param_key) {
                Some(Value::String(node)) => Ok(node.clone()),
                Some(_) | None => Err(ResolutionError::Unbound(param_key.clone())),
            };
        }
    }
    Ok(step.node.clone())
}

// ═══════════════════════════════════════════════════════════════════════════
// Feed-forward
// ═══════════════════════════════════════════════════════════════════════════

/// Apply feed-forward bindings produced by the step at `completed_index`.
///
/// Matching is by index or step key. Within the matched step's promoted
/// datapoints, the labeled entry is picked; with no label the step must
/// have produced exactly one datapoint.
pub fn feed_data_forward(
    workflow: &mut Workflow,
    completed_index: usize,
) -> Result<(), ResolutionError> {
    let step = match workflow.steps.get(completed_index) {
        Some(s) => s.clone(),
        None => return Ok(()),
    };

    let mut new_values: Vec<(String, Value)> = Vec::new();
    let mut new_files: Vec<(String, String)> = Vec::new();

    for ff in &workflow.parameters.feed_forward {
        if !ff.step.matches(completed_index, step.key.as_deref()) {
            continue;
        }
        let result = step
            .result
            .as_ref()
            .ok_or_else(|| ResolutionError::NoResult(step.name.clone()))?;

        let label = match &ff.label {
            Some(label) => {
                if !result.datapoints.contains_key(label) {
                    return Err(ResolutionError::LabelNotFound(label.clone()));
                }
                label.clone()
            }
            None => {
                if result.datapoints.len() != 1 {
                    return Err(ResolutionError::AmbiguousFeedForward(ff.key.clone()));
                }
                result.datapoints.keys().next().cloned().unwrap_or_default()
            }
        };

        match ff.data_type {
            FeedForwardType::Json => {
                let value = result
                    .data
                    .get(&label)
                    .cloned()
                    .ok_or_else(|| ResolutionError::LabelNotFound(label.clone()))?;
                new_values.push((ff.key.clone(), value));
            }
            FeedForwardType::File => {
                let id = result
                    .datapoints
                    .get(&label)
                    .cloned()
                    .ok_or_else(|| ResolutionError::LabelNotFound(label.clone()))?;
                new_files.push((ff.key.clone(), id));
            }
        }
    }

    workflow.parameter_values.extend(new_values);
    workflow.file_input_ids.extend(new_files);
    Ok(())
}
