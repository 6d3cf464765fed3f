use crate::{GraphId, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Running => "RUNNING",
            NodeStatus::Completed => "COMPLETED",
            NodeStatus::Failed => "FAILED",
            NodeStatus::Cancelled => "CANCELLED",
            NodeStatus::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// One execution of a compiled graph against specific input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub graph_version: u64,
    pub status: RunStatus,
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message: Option<String>,
    /// Node whose failure ended the run.
    #[serde(default)]
    pub failed_node: Option<NodeId>,
    /// Node status counts, filled in when the run finalizes.
    #[serde(default)]
    pub summary: Option<RunSummary>,
}

impl Run {
    pub fn new(graph_id: GraphId, graph_version: u64, input: serde_json::Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            graph_id,
            graph_version,
            status: RunStatus::Pending,
            input,
            output: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_message: None,
            failed_node: None,
            summary: None,
        }
    }

    /// Apply a status transition. Timestamps follow the new status.
    pub fn apply(&mut self, update: RunUpdate) {
        let now = Utc::now();
        if update.status == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if update.status.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = update.status;
        if update.output.is_some() {
            self.output = update.output;
        }
        if update.last_message.is_some() {
            self.last_message = update.last_message;
        }
        if update.failed_node.is_some() {
            self.failed_node = update.failed_node;
        }
        if update.summary.is_some() {
            self.summary = update.summary;
        }
    }
}

/// A single atomic change to a run record.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub output: Option<serde_json::Value>,
    pub last_message: Option<String>,
    pub failed_node: Option<NodeId>,
    pub summary: Option<RunSummary>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status,
            output: None,
            last_message: None,
            failed_node: None,
            summary: None,
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.last_message = Some(message.into());
        self
    }

    pub fn with_failed_node(mut self, node: NodeId) -> Self {
        self.failed_node = Some(node);
        self
    }

    pub fn with_summary(mut self, summary: RunSummary) -> Self {
        self.summary = Some(summary);
        self
    }
}

/// Count of node states per status for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn from_states<'a>(states: impl IntoIterator<Item = &'a NodeState>) -> Self {
        let mut summary = Self::default();
        for state in states {
            match state.status {
                NodeStatus::Completed => summary.completed += 1,
                NodeStatus::Failed => summary.failed += 1,
                NodeStatus::Cancelled => summary.cancelled += 1,
                NodeStatus::Skipped => summary.skipped += 1,
                NodeStatus::Pending | NodeStatus::Running => {}
            }
        }
        summary
    }
}

/// State of one node within one run, keyed by `(run_id, node_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub progress: f64,
    /// Attempts made so far, counting the one in flight.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    /// Errors of earlier attempts that were retried.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_history: Vec<String>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

impl NodeState {
    pub fn new(run_id: RunId, node_id: NodeId, status: NodeStatus) -> Self {
        Self {
            run_id,
            node_id,
            status,
            progress: 0.0,
            attempts: 0,
            started_at: None,
            completed_at: None,
            error: None,
            error_history: Vec::new(),
            output: None,
        }
    }

    pub fn running(run_id: RunId, node_id: NodeId) -> Self {
        let mut state = Self::new(run_id, node_id, NodeStatus::Running);
        state.started_at = Some(Utc::now());
        state.attempts = 1;
        state
    }

    pub fn skipped(run_id: RunId, node_id: NodeId) -> Self {
        let mut state = Self::new(run_id, node_id, NodeStatus::Skipped);
        state.completed_at = Some(Utc::now());
        state
    }

    pub fn complete(&mut self, output: serde_json::Value) {
        self.status = NodeStatus::Completed;
        self.progress = 1.0;
        self.completed_at = Some(Utc::now());
        self.output = Some(output);
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = NodeStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    pub fn cancel(&mut self) {
        self.status = NodeStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}
