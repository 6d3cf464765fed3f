use super::{sort_node_states, RunStore};
use crate::{NodeId, NodeState, Run, RunId, RunUpdate, StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;

/// Process-local store with record-level locking.
///
/// Runs and node states live in separate maps keyed by `run_id` and
/// `(run_id, node_id)`, so writers of different records never contend.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: DashMap<RunId, Run>,
    nodes: DashMap<(RunId, NodeId), NodeState>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: Run) -> StoreResult<()> {
        self.runs.insert(run.run_id, run);
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> StoreResult<Run> {
        self.runs
            .get(&run_id)
            .map(|run| run.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn update_run_status(&self, run_id: RunId, update: RunUpdate) -> StoreResult<Run> {
        let mut run = self
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(StoreError::TerminalRun(run_id));
        }
        run.apply(update);
        Ok(run.clone())
    }

    async fn set_node_state(&self, state: NodeState) -> StoreResult<()> {
        {
            let run = self
                .runs
                .get(&state.run_id)
                .ok_or(StoreError::RunNotFound(state.run_id))?;
            if run.status.is_terminal() {
                return Err(StoreError::TerminalRun(state.run_id));
            }
        }
        self.nodes
            .insert((state.run_id, state.node_id.clone()), state);
        Ok(())
    }

    async fn get_node_state(
        &self,
        run_id: RunId,
        node_id: &NodeId,
    ) -> StoreResult<Option<NodeState>> {
        Ok(self
            .nodes
            .get(&(run_id, node_id.clone()))
            .map(|state| state.clone()))
    }

    async fn list_node_states(&self, run_id: RunId) -> StoreResult<Vec<NodeState>> {
        if !self.runs.contains_key(&run_id) {
            return Err(StoreError::RunNotFound(run_id));
        }
        let mut states: Vec<NodeState> = self
            .nodes
            .iter()
            .filter(|entry| entry.key().0 == run_id)
            .map(|entry| entry.value().clone())
            .collect();
        sort_node_states(&mut states);
        Ok(states)
    }

    async fn list_runs(&self) -> StoreResult<Vec<Run>> {
        let mut runs: Vec<Run> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }
}
