use relaycore::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Per-run cap on concurrently executing nodes
    pub max_parallel_nodes: usize,
    /// Broadcast capacity; subscribers further behind lose events
    pub event_buffer_size: usize,
    /// Applied to nodes that declare no timeout
    pub default_node_timeout_ms: Option<u64>,
    /// Applied to nodes that declare no retry policy
    pub default_retry: Option<RetryPolicy>,
    /// Record SKIPPED for targets of conditional edges whose label was not selected
    pub record_bypassed_branches: bool,
}

impl RuntimeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn default_node_timeout(&self) -> Option<Duration> {
        self.default_node_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            default_node_timeout_ms: None,
            default_retry: None,
            record_bypassed_branches: true,
        }
    }
}
