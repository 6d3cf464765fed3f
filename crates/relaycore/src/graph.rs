use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type GraphId = Uuid;

/// Reserved edge label taken when the source node fails terminally.
pub const ERROR_LABEL: &str = "error";

/// Reserved edge target that ends a branch without running anything.
pub const END_NODE: &str = "END";

/// Identifier of a node, unique within one graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn end() -> Self {
        Self(END_NODE.to_string())
    }

    pub fn is_end(&self) -> bool {
        self.0 == END_NODE
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Complete graph definition as submitted by an authoring tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default = "Uuid::new_v4")]
    pub id: GraphId,
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

fn default_version() -> u64 {
    1
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Unconditional edge.
    pub fn connect(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        self.edges.push(EdgeSpec {
            source: source.into(),
            target: target.into(),
            condition: None,
        });
    }

    /// Edge taken only when `source` selects `label`.
    pub fn connect_when(
        &mut self,
        source: impl Into<NodeId>,
        label: impl Into<String>,
        target: impl Into<NodeId>,
    ) {
        self.edges.push(EdgeSpec {
            source: source.into(),
            target: target.into(),
            condition: Some(label.into()),
        });
    }

    /// Edge taken only when `source` fails after its retry budget.
    pub fn connect_on_error(&mut self, source: impl Into<NodeId>, target: impl Into<NodeId>) {
        self.connect_when(source, ERROR_LABEL, target);
    }

    pub fn find_node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Bump the version after mutating a graph that was already compiled.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}

/// Closed set of step kinds the engine knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    #[serde(rename = "llm-step")]
    Llm,
    #[serde(rename = "tool-step")]
    Tool,
    #[serde(rename = "condition-step")]
    Condition,
    #[serde(rename = "custom-step")]
    Custom,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Llm => "llm-step",
            NodeKind::Tool => "tool-step",
            NodeKind::Condition => "condition-step",
            NodeKind::Custom => "custom-step",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node specification in a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Named capability to run instead of the kind's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Opaque to the engine; handed to the step as-is.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Labels this node may select for its conditional edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            handler: None,
            config: serde_json::Value::Null,
            branches: Vec::new(),
            retry: None,
            timeout_ms: None,
        }
    }

    /// Set one key of the config object, turning a null config into an object.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if !self.config.is_object() {
            self.config = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.config.as_object_mut() {
            map.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_branches<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.branches = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
        });
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Possible transition between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl EdgeSpec {
    pub fn is_error_edge(&self) -> bool {
        self.condition.as_deref() == Some(ERROR_LABEL)
    }
}

/// Retry policy for node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.delay_ms as f64 * self.backoff_multiplier.max(0.0).powi(exponent);
        std::time::Duration::from_millis(millis.round() as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}
