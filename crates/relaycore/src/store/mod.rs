//! Run State Store: the authoritative record of runs and node states.

mod file;
mod memory;

pub use file::JsonFileRunStore;
pub use memory::InMemoryRunStore;

use crate::{NodeId, NodeState, Run, RunId, RunUpdate, StoreResult};
use async_trait::async_trait;

/// Queryable record of every run and every `(run_id, node_id)` state.
///
/// Each method is a single atomic write or read: concurrent readers see a
/// record either before or after a transition, never in between. Writes to
/// a run that already reached a terminal status fail with
/// [`StoreError::TerminalRun`](crate::StoreError::TerminalRun).
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: Run) -> StoreResult<()>;

    async fn get_run(&self, run_id: RunId) -> StoreResult<Run>;

    /// Apply a status transition and return the updated record.
    async fn update_run_status(&self, run_id: RunId, update: RunUpdate) -> StoreResult<Run>;

    /// Insert or replace the state of one node.
    async fn set_node_state(&self, state: NodeState) -> StoreResult<()>;

    async fn get_node_state(&self, run_id: RunId, node_id: &NodeId)
        -> StoreResult<Option<NodeState>>;

    /// Node states of a run, in the order the nodes were reached.
    async fn list_node_states(&self, run_id: RunId) -> StoreResult<Vec<NodeState>>;

    async fn list_runs(&self) -> StoreResult<Vec<Run>>;
}

pub(crate) fn sort_node_states(states: &mut [NodeState]) {
    states.sort_by(|a, b| {
        let ka = a.started_at.or(a.completed_at);
        let kb = b.started_at.or(b.completed_at);
        ka.cmp(&kb).then_with(|| a.node_id.cmp(&b.node_id))
    });
}
