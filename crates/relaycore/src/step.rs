use crate::{NodeId, NodeKind, RunId, StepError, WorkingState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Capability that runs the body of a node.
///
/// Implementations are registered by node kind or by handler name; the engine
/// never looks inside them.
#[async_trait]
pub trait Step: Send + Sync {
    /// Execute the step against a snapshot of the run's working state
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError>;

    /// Optional: Validate node configuration before a run is accepted
    fn validate_config(&self, _config: &serde_json::Value) -> Result<(), StepError> {
        Ok(())
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata::default()
    }
}

/// Descriptive information shown by tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetadata {
    pub description: String,
    pub category: String,
    /// Branch labels the step may select.
    pub branches: Vec<String>,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            branches: Vec::new(),
        }
    }
}

/// Execution context passed to each step
#[derive(Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub kind: NodeKind,
    /// Static configuration for this node
    pub config: serde_json::Value,
    /// Working state as it was when the node was dispatched
    pub state: Arc<WorkingState>,
    /// 1-based attempt number
    pub attempt: u32,
    pub progress: ProgressReporter,
    /// Cancelled when the run is asked to stop; steps may honour it
    pub cancellation: CancellationToken,
}

impl StepContext {
    pub fn new(run_id: RunId, node_id: NodeId, kind: NodeKind, state: Arc<WorkingState>) -> Self {
        Self {
            run_id,
            node_id,
            kind,
            config: serde_json::Value::Null,
            state,
            attempt: 1,
            progress: ProgressReporter::disabled(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&serde_json::Value, StepError> {
        self.config
            .get(name)
            .ok_or_else(|| StepError::Configuration(format!("Missing config: {}", name)))
    }

    pub fn config_str(&self, name: &str) -> Option<&str> {
        self.config.get(name).and_then(|v| v.as_str())
    }

    /// Get a working-state value or return error
    pub fn require_input(&self, path: &str) -> Result<&serde_json::Value, StepError> {
        self.state
            .get(path)
            .ok_or_else(|| StepError::MissingInput(path.to_string()))
    }
}

/// Output from a step execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub data: serde_json::Value,
    /// Branch labels selected for conditional edges
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
}

impl StepOutput {
    pub fn new(data: impl Into<serde_json::Value>) -> Self {
        Self {
            data: data.into(),
            branches: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_branch(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        if !self.branches.contains(&label) {
            self.branches.push(label);
        }
        self
    }
}

/// Progress report emitted by a running step.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub node_id: NodeId,
    pub progress: f64,
    pub message: Option<String>,
}

type ProgressSink = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Handle steps use to report progress back to the engine
#[derive(Clone)]
pub struct ProgressReporter {
    node_id: NodeId,
    sink: Option<ProgressSink>,
}

impl ProgressReporter {
    pub fn new(node_id: NodeId, sink: impl Fn(ProgressUpdate) + Send + Sync + 'static) -> Self {
        Self {
            node_id,
            sink: Some(Arc::new(sink)),
        }
    }

    /// Reporter that drops every update.
    pub fn disabled() -> Self {
        Self {
            node_id: NodeId::new(""),
            sink: None,
        }
    }

    /// Report a fraction in `0.0..=1.0`; out-of-range values are clamped.
    pub fn report(&self, progress: f64, message: Option<String>) {
        let Some(sink) = &self.sink else { return };
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        sink(ProgressUpdate {
            node_id: self.node_id.clone(),
            progress,
            message,
        });
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("node_id", &self.node_id)
            .field("enabled", &self.sink.is_some())
            .finish()
    }
}
