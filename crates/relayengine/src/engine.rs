use crate::cache::PlanCache;
use crate::compiler::ExecutablePlan;
use crate::config::RuntimeConfig;
use crate::error::EngineError;
use crate::executor::NodeExecutor;
use crate::registry::CapabilityRegistry;
use crate::scheduler::RunScheduler;
use dashmap::DashMap;
use relaycore::{
    Event, EventBus, EventKind, Graph, GraphId, InMemoryRunStore, NodeState, Run, RunId,
    RunNotice, RunStatus, RunStore, RunSubscription, RunUpdate, StoreError,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Entry point for registering graphs and running them.
///
/// Runs are independent: each is driven by its own scheduler and shares
/// nothing with other runs except the store and the event bus.
pub struct WorkflowEngine {
    config: RuntimeConfig,
    store: Arc<dyn RunStore>,
    events: Arc<EventBus>,
    executor: NodeExecutor,
    plans: PlanCache,
    graphs: RwLock<HashMap<GraphId, Graph>>,
    cancellations: DashMap<RunId, CancellationToken>,
    active: DashMap<RunId, ()>,
}

impl WorkflowEngine {
    /// Create an engine with an in-memory store and default settings
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: Arc<CapabilityRegistry>, config: RuntimeConfig) -> Self {
        Self::with_store(registry, Arc::new(InMemoryRunStore::new()), config)
    }

    pub fn with_store(
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn RunStore>,
        config: RuntimeConfig,
    ) -> Self {
        let events = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            config,
            store,
            events,
            executor: NodeExecutor::new(registry),
            plans: PlanCache::new(),
            graphs: RwLock::new(HashMap::new()),
            cancellations: DashMap::new(),
            active: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        self.executor.registry()
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn plans(&self) -> &PlanCache {
        &self.plans
    }

    /// Compile a graph and check it against the registry without keeping it.
    pub fn validate(&self, graph: &Graph) -> Result<Arc<ExecutablePlan>, EngineError> {
        let plan = self.plans.get_or_compile(graph)?;
        self.registry().check_plan(&plan)?;
        Ok(plan)
    }

    /// Compile and register a graph; the newest version wins for new runs.
    pub async fn register_graph(&self, graph: Graph) -> Result<Arc<ExecutablePlan>, EngineError> {
        let plan = self.validate(&graph)?;
        tracing::info!(
            "Registered graph {} ({}) version {}",
            graph.name,
            graph.id,
            graph.version
        );
        self.graphs.write().await.insert(graph.id, graph);
        Ok(plan)
    }

    pub async fn graph(&self, graph_id: GraphId) -> Option<Graph> {
        self.graphs.read().await.get(&graph_id).cloned()
    }

    async fn plan_for(&self, graph_id: GraphId, version: u64) -> Result<Arc<ExecutablePlan>, EngineError> {
        if let Some(plan) = self.plans.get(graph_id, version) {
            return Ok(plan);
        }
        let graphs = self.graphs.read().await;
        let graph = graphs
            .get(&graph_id)
            .filter(|g| g.version == version)
            .ok_or(EngineError::GraphNotFound(graph_id))?;
        self.validate(graph)
    }

    /// Record a new PENDING run against the latest version of a graph.
    pub async fn create_run(
        &self,
        graph_id: GraphId,
        input: serde_json::Value,
    ) -> Result<RunId, EngineError> {
        let version = self
            .graphs
            .read()
            .await
            .get(&graph_id)
            .map(|g| g.version)
            .ok_or(EngineError::GraphNotFound(graph_id))?;
        let plan = self.plan_for(graph_id, version).await?;

        let run = Run::new(graph_id, plan.version, input);
        let run_id = run.run_id;
        self.store.create_run(run).await?;
        self.events.publish(Event::run(
            run_id,
            EventKind::RunCreated,
            json!({ "graph_id": graph_id, "graph_version": plan.version }),
        ));
        tracing::info!(run_id = %run_id, graph_id = %graph_id, "run created");
        Ok(run_id)
    }

    /// Drive a run to a terminal status and return it.
    ///
    /// Calling this on a run that is already running or finished does
    /// nothing and returns the stored status.
    pub async fn execute(&self, run_id: RunId) -> Result<RunStatus, EngineError> {
        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Ok(run.status);
        }
        if self.active.insert(run_id, ()).is_some() {
            return Ok(self.get_run(run_id).await?.status);
        }

        let result = self.execute_claimed(run_id).await;
        self.active.remove(&run_id);
        result
    }

    async fn execute_claimed(&self, run_id: RunId) -> Result<RunStatus, EngineError> {
        // Another caller may have finished the run between the read and the claim.
        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Ok(run.status);
        }

        let plan = self.plan_for(run.graph_id, run.graph_version).await?;
        let cancellation = self
            .cancellations
            .entry(run_id)
            .or_insert_with(CancellationToken::new)
            .clone();

        let scheduler = RunScheduler::new(
            plan,
            self.store.clone(),
            self.events.clone(),
            self.executor.clone(),
            self.config.clone(),
            cancellation,
            run,
        );
        let result = scheduler.drive().await;
        self.cancellations.remove(&run_id);
        result.map(|run| run.status)
    }

    /// Execute a run on its own task.
    pub fn spawn(self: &Arc<Self>, run_id: RunId) -> JoinHandle<Result<RunStatus, EngineError>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.execute(run_id).await })
    }

    /// Create and execute a run in one call, returning the final record.
    pub async fn run(
        &self,
        graph_id: GraphId,
        input: serde_json::Value,
    ) -> Result<Run, EngineError> {
        let run_id = self.create_run(graph_id, input).await?;
        self.execute(run_id).await?;
        self.get_run(run_id).await
    }

    /// Record a cancellation intent. Returns `false` if the run already finished.
    ///
    /// Nodes already in flight are allowed to finish; nothing new is
    /// dispatched once the scheduler observes the intent.
    pub async fn cancel(&self, run_id: RunId) -> Result<bool, EngineError> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        self.cancellations
            .entry(run_id)
            .or_insert_with(CancellationToken::new)
            .cancel();
        tracing::info!(run_id = %run_id, status = %run.status, "cancellation requested");
        Ok(true)
    }

    pub fn is_cancel_requested(&self, run_id: RunId) -> bool {
        self.cancellations
            .get(&run_id)
            .map(|token| token.is_cancelled())
            .unwrap_or(false)
    }

    /// Mark a run halted by a store failure as FAILED once the store is back.
    pub async fn abandon(&self, run_id: RunId, reason: impl Into<String>) -> Result<Run, EngineError> {
        let run = self
            .store
            .update_run_status(
                run_id,
                RunUpdate::status(RunStatus::Failed).with_message(reason),
            )
            .await
            .map_err(|e| self.not_found_or(run_id, e))?;
        self.cancellations.remove(&run_id);
        self.events.publish(Event::run(
            run_id,
            EventKind::RunFailed,
            json!({ "status": run.status, "message": run.last_message }),
        ));
        Ok(run)
    }

    /// Wait until a run executed elsewhere reaches a terminal status.
    pub async fn wait(&self, run_id: RunId) -> Result<Run, EngineError> {
        // Subscribe first so the terminal event cannot slip between the read and the wait
        let mut events = self.events.subscribe_run(run_id);
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        while let Some(notice) = events.recv_notice().await {
            match notice {
                RunNotice::Event(event) if event.kind.is_run_terminal() => break,
                RunNotice::Event(_) => {}
                // The terminal event may be among the dropped ones
                RunNotice::Lagged(_) => {
                    let run = self.get_run(run_id).await?;
                    if run.status.is_terminal() {
                        return Ok(run);
                    }
                }
            }
        }
        self.get_run(run_id).await
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Run, EngineError> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .map_err(|e| self.not_found_or(run_id, e))?;
        if run.status.is_terminal() {
            self.forget(run_id);
        }
        Ok(run)
    }

    /// Drop per-run bookkeeping of a finished run.
    fn forget(&self, run_id: RunId) {
        self.cancellations.remove(&run_id);
        self.events.forget_run(run_id);
    }

    /// Runs holding a cancellation token.
    pub fn cancellation_count(&self) -> usize {
        self.cancellations.len()
    }

    pub async fn list_node_states(&self, run_id: RunId) -> Result<Vec<NodeState>, EngineError> {
        self.store
            .list_node_states(run_id)
            .await
            .map_err(|e| self.not_found_or(run_id, e))
    }

    pub async fn list_runs(&self) -> Result<Vec<Run>, EngineError> {
        Ok(self.store.list_runs().await?)
    }

    /// Live events of one run. Missed events must be re-derived from the store.
    pub fn subscribe(&self, run_id: RunId) -> RunSubscription {
        self.events.subscribe_run(run_id)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn not_found_or(&self, run_id: RunId, error: StoreError) -> EngineError {
        match error {
            StoreError::RunNotFound(_) => EngineError::RunNotFound(run_id),
            other => EngineError::Store(other),
        }
    }
}
