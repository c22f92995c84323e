//! Typed failure categories for the orchestration core.
//!
//! Each category maps to a propagation policy: validation errors surface at
//! submission, scheduling obstacles are retried on later ticks, dispatch
//! errors are recoverable within a step, and state errors propagate as
//! internal faults.

use thiserror::Error;

use crate::types::WorkcellError;

/// Errors surfaced at workflow submission time. These reject the request;
/// no workflow is created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required value {0} not provided")]
    MissingInput(String),

    #[error("Required file {0} not provided")]
    MissingFile(String),

    #[error("{0} is a Feed Forward Value and will be calculated during execution")]
    FeedForwardConflict(String),

    #[error("step {step} references unknown node {node}")]
    UnknownNode { step: String, node: String },

    #[error("feed-forward for {key} references step {step}, which does not exist")]
    UnknownStep { key: String, step: String },

    #[error("{0}")]
    Invalid(String),
}

/// Errors raised while resolving parameters or feed-forward values during
/// execution. These fail the owning workflow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("parameter {0} is not bound and has no default")]
    Unbound(String),

    #[error("Ambiguous feed-forward parameter {0}")]
    AmbiguousFeedForward(String),

    #[error("specified label {0} not found")]
    LabelNotFound(String),

    #[error("feed-forward step {0} has no result")]
    NoResult(String),
}

/// Errors raised while dispatching a step to a node.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("node {0} is not registered")]
    UnknownNode(String),

    #[error("node {node} transport failure: {source}")]
    Transport {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("action {0} timed out")]
    Timeout(String),

    #[error("parameter resolution failed: {0}")]
    Resolution(#[from] ResolutionError),
}

impl DispatchError {
    /// Convert to the wire error envelope attached to step results.
    pub fn to_workcell_error(&self) -> WorkcellError {
        let error_type = match self {
            DispatchError::UnknownNode(_) => "UnknownNode",
            DispatchError::Transport { .. } => "TransportError",
            DispatchError::Timeout(_) => "StepTimeout",
            DispatchError::Resolution(_) => "ResolutionError",
        };
        WorkcellError::new(error_type, self.to_string())
    }
}

/// Internal state-handler faults. These propagate to the control plane as
/// HTTP 500 and leave the workflow in its last persisted state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("location {0} not found")]
    LocationNotFound(String),

    #[error("definition {0} not found")]
    DefinitionNotFound(String),

    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}
