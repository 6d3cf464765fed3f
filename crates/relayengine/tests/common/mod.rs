#![allow(dead_code)]

use async_trait::async_trait;
use relaycore::{
    InMemoryRunStore, NodeId, NodeKind, NodeState, Run, RunId, RunStore, RunUpdate, Step,
    StepContext, StepError, StepOutput, StoreError, StoreResult,
};
use relayengine::{CapabilityRegistry, RuntimeConfig, WorkflowEngine};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("relayengine=debug")
        .with_test_writer()
        .try_init();
}

/// Returns `config.output` (or the value at `config.from`, or the node id)
/// and selects `config.branch`, a label or a list of labels.
pub struct EchoStep;

#[async_trait]
impl Step for EchoStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let data = if let Some(output) = ctx.config.get("output") {
            output.clone()
        } else if let Some(path) = ctx.config_str("from") {
            ctx.require_input(path)?.clone()
        } else {
            json!({ "node": ctx.node_id.as_str() })
        };
        let mut output = StepOutput::new(data);
        match ctx.config.get("branch") {
            Some(Value::String(label)) => output = output.with_branch(label.clone()),
            Some(Value::Array(labels)) => {
                for label in labels.iter().filter_map(Value::as_str) {
                    output = output.with_branch(label);
                }
            }
            _ => {}
        }
        Ok(output)
    }
}

/// Fails its first `failures` attempts, then succeeds.
pub struct FlakyStep {
    failures: u32,
    pub calls: AtomicU32,
}

impl FlakyStep {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Step for FlakyStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(StepError::ExecutionFailed(format!("attempt {} failed", ctx.attempt)));
        }
        Ok(StepOutput::new(json!({ "fetched": true, "attempt": ctx.attempt })))
    }
}

/// Sleeps `config.sleep_ms` (default 50) and tracks how many run at once.
#[derive(Default)]
pub struct SleepStep {
    current: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    pub calls: AtomicU32,
    pub order: Mutex<Vec<String>>,
}

#[async_trait]
impl Step for SleepStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let ms = ctx.config.get("sleep_ms").and_then(Value::as_u64).unwrap_or(50);
        ctx.progress.report(0.5, Some("halfway".to_string()));
        tokio::time::sleep(Duration::from_millis(ms)).await;

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.order
            .lock()
            .unwrap()
            .push(ctx.node_id.as_str().to_string());
        Ok(StepOutput::new(json!({ "slept_ms": ms })))
    }
}

/// Sleeps `config.sleep_ms` without reporting progress or watching for
/// cancellation, then fails if `config.fail` is set.
pub struct QuietStep;

#[async_trait]
impl Step for QuietStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let ms = ctx.config.get("sleep_ms").and_then(Value::as_u64).unwrap_or(50);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        if ctx.config.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(StepError::ExecutionFailed("quiet failure".to_string()));
        }
        Ok(StepOutput::new(json!({ "slept_ms": ms })))
    }
}

pub struct FailStep;

#[async_trait]
impl Step for FailStep {
    async fn execute(&self, _ctx: StepContext) -> Result<StepOutput, StepError> {
        Err(StepError::ExecutionFailed("boom".to_string()))
    }
}

pub struct PanicStep;

#[async_trait]
impl Step for PanicStep {
    async fn execute(&self, _ctx: StepContext) -> Result<StepOutput, StepError> {
        panic!("step blew up");
    }
}

/// Handles to the scripted steps registered by [`registry`].
pub struct Steps {
    pub flaky: Arc<FlakyStep>,
    pub sleep: Arc<SleepStep>,
}

/// Registry with `custom-step` -> echo and tool handlers
/// `flaky`, `sleep`, `quiet`, `fail` and `panic`.
pub fn registry(flaky_failures: u32) -> (Arc<CapabilityRegistry>, Steps) {
    let flaky = Arc::new(FlakyStep::new(flaky_failures));
    let sleep = Arc::new(SleepStep::default());

    let mut registry = CapabilityRegistry::new();
    registry.register_default(NodeKind::Custom, Arc::new(EchoStep));
    registry.register_default(NodeKind::Condition, Arc::new(EchoStep));
    registry.register(NodeKind::Tool, "flaky", flaky.clone());
    registry.register(NodeKind::Tool, "sleep", sleep.clone());
    registry.register(NodeKind::Tool, "quiet", Arc::new(QuietStep));
    registry.register(NodeKind::Tool, "fail", Arc::new(FailStep));
    registry.register(NodeKind::Tool, "panic", Arc::new(PanicStep));

    (Arc::new(registry), Steps { flaky, sleep })
}

pub fn engine(flaky_failures: u32, config: RuntimeConfig) -> (Arc<WorkflowEngine>, Steps) {
    init_tracing();
    let (registry, steps) = registry(flaky_failures);
    (Arc::new(WorkflowEngine::with_config(registry, config)), steps)
}

/// Store that refuses every write for one node.
pub struct FlakyStore {
    inner: InMemoryRunStore,
    broken_node: NodeId,
}

impl FlakyStore {
    pub fn new(broken_node: &str) -> Self {
        Self {
            inner: InMemoryRunStore::new(),
            broken_node: NodeId::from(broken_node),
        }
    }
}

#[async_trait]
impl RunStore for FlakyStore {
    async fn create_run(&self, run: Run) -> StoreResult<()> {
        self.inner.create_run(run).await
    }

    async fn get_run(&self, run_id: RunId) -> StoreResult<Run> {
        self.inner.get_run(run_id).await
    }

    async fn update_run_status(&self, run_id: RunId, update: RunUpdate) -> StoreResult<Run> {
        self.inner.update_run_status(run_id, update).await
    }

    async fn set_node_state(&self, state: NodeState) -> StoreResult<()> {
        if state.node_id == self.broken_node {
            return Err(StoreError::Unavailable("disk full".to_string()));
        }
        self.inner.set_node_state(state).await
    }

    async fn get_node_state(
        &self,
        run_id: RunId,
        node_id: &NodeId,
    ) -> StoreResult<Option<NodeState>> {
        self.inner.get_node_state(run_id, node_id).await
    }

    async fn list_node_states(&self, run_id: RunId) -> StoreResult<Vec<NodeState>> {
        self.inner.list_node_states(run_id).await
    }

    async fn list_runs(&self) -> StoreResult<Vec<Run>> {
        self.inner.list_runs().await
    }
}
