use crate::{NodeId, RunId};
use thiserror::Error;

/// Raised by the compiler before any run starts. Never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphValidationError {
    #[error("Graph has no nodes")]
    Empty,

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Node id '{0}' is reserved")]
    ReservedNodeId(NodeId),

    #[error("Edge {from} -> {to} references unknown node '{missing}'")]
    UnknownNode {
        from: NodeId,
        to: NodeId,
        missing: NodeId,
    },

    #[error("Cycle detected through nodes: {}", format_ids(.nodes))]
    Cycle { nodes: Vec<NodeId> },

    #[error("Expected exactly one entry node, found {}: [{}]", .candidates.len(), format_ids(.candidates))]
    EntryCount { candidates: Vec<NodeId> },

    #[error("Edge {from} -> {to} uses label '{label}' which node '{from}' never selects")]
    UnknownBranch {
        from: NodeId,
        to: NodeId,
        label: String,
    },

    #[error("No capability registered for node '{node}' ({binding})")]
    UnknownCapability { node: NodeId, binding: String },

    #[error("Invalid config for node '{node}': {message}")]
    InvalidConfig { node: NodeId, message: String },
}

fn format_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Node-level failure returned by a step or by the executor around it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("No capability registered for {0}")]
    NoCapability(String),

    #[error("Cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::ExecutionFailed(_) | StepError::Timeout { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StepError::Timeout { .. })
    }

    /// Short machine-readable tag used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::ExecutionFailed(_) => "execution",
            StepError::Timeout { .. } => "timeout",
            StepError::Configuration(_) => "configuration",
            StepError::MissingInput(_) => "missing_input",
            StepError::NoCapability(_) => "no_capability",
            StepError::Cancelled => "cancelled",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {0} is already in a terminal status")]
    TerminalRun(RunId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
