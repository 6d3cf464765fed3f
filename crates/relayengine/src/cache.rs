use crate::compiler::{Compiler, ExecutablePlan};
use dashmap::DashMap;
use relaycore::{Graph, GraphId, GraphValidationError};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
struct CacheKey {
    graph_id: GraphId,
    version: u64,
}

/// Compiled plans keyed by graph identity and version.
///
/// A mutated graph must carry a new version; entries are never polled for
/// staleness.
#[derive(Default)]
pub struct PlanCache {
    plans: DashMap<CacheKey, Arc<ExecutablePlan>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, graph_id: GraphId, version: u64) -> Option<Arc<ExecutablePlan>> {
        self.plans
            .get(&CacheKey { graph_id, version })
            .map(|plan| plan.clone())
    }

    pub fn get_or_compile(&self, graph: &Graph) -> Result<Arc<ExecutablePlan>, GraphValidationError> {
        let key = CacheKey {
            graph_id: graph.id,
            version: graph.version,
        };
        if let Some(plan) = self.plans.get(&key) {
            tracing::trace!(graph_id = %graph.id, version = graph.version, "plan cache hit");
            return Ok(plan.clone());
        }

        let plan = Arc::new(Compiler::compile(graph)?);
        self.plans.insert(key, plan.clone());
        Ok(plan)
    }

    /// Drop every cached version of a graph.
    pub fn invalidate(&self, graph_id: GraphId) -> usize {
        let before = self.plans.len();
        self.plans.retain(|key, _| key.graph_id != graph_id);
        before.saturating_sub(self.plans.len())
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
