use crate::compiler::{EdgeGuard, ExecutablePlan, StepBinding};
use crate::config::RuntimeConfig;
use crate::error::EngineError;
use crate::executor::NodeExecutor;
use relaycore::{
    Event, EventBus, EventKind, NodeId, NodeKind, NodeState, NodeStatus, ProgressReporter,
    RetryPolicy, Run, RunId, RunStatus, RunStore, RunSummary, RunUpdate, StepContext, StepError,
    StepOutput, StoreError, WorkingState,
};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Messages from node tasks back to the run loop.
///
/// Everything a node task reports goes through one channel so the loop sees
/// progress, retries and the final result in the order they happened.
enum NodeSignal {
    Progress {
        node_id: NodeId,
        progress: f64,
        message: Option<String>,
    },
    Retrying {
        node_id: NodeId,
        attempt: u32,
        max_attempts: u32,
        error: StepError,
        delay: Duration,
    },
    Finished {
        node_id: NodeId,
        attempts: u32,
        result: Result<StepOutput, StepError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Halt {
    Failed,
    Cancelled,
}

/// Everything a node task needs, detached from the scheduler.
struct NodeJob {
    run_id: RunId,
    node_id: NodeId,
    kind: NodeKind,
    binding: StepBinding,
    config: serde_json::Value,
    state: Arc<WorkingState>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
    executor: NodeExecutor,
    cancellation: CancellationToken,
    signals: mpsc::UnboundedSender<NodeSignal>,
}

impl NodeJob {
    async fn run(self) {
        let max_attempts = self
            .retry
            .as_ref()
            .map(|p| p.max_attempts.max(1))
            .unwrap_or(1);
        let mut attempt = 1;

        loop {
            let sink = self.signals.clone();
            let progress = ProgressReporter::new(self.node_id.clone(), move |update| {
                let _ = sink.send(NodeSignal::Progress {
                    node_id: update.node_id,
                    progress: update.progress,
                    message: update.message,
                });
            });
            let ctx = StepContext {
                run_id: self.run_id,
                node_id: self.node_id.clone(),
                kind: self.kind,
                config: self.config.clone(),
                state: self.state.clone(),
                attempt,
                progress,
                cancellation: self.cancellation.clone(),
            };

            let result = self.executor.execute(&self.binding, ctx, self.timeout).await;
            let error = match result {
                Ok(output) => {
                    self.finish(attempt, Ok(output));
                    return;
                }
                Err(e) => e,
            };

            let retry = self.retry.as_ref().filter(|_| error.is_retryable() && attempt < max_attempts);
            let Some(policy) = retry else {
                self.finish(attempt, Err(error));
                return;
            };

            // A retry is a fresh dispatch; a cancelled run does not get one.
            if self.cancellation.is_cancelled() {
                self.finish(attempt, Err(StepError::Cancelled));
                return;
            }

            let delay = policy.delay_after(attempt);
            let _ = self.signals.send(NodeSignal::Retrying {
                node_id: self.node_id.clone(),
                attempt,
                max_attempts,
                error,
                delay,
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancellation.cancelled() => {
                    self.finish(attempt, Err(StepError::Cancelled));
                    return;
                }
            }
            attempt += 1;
        }
    }

    fn finish(&self, attempts: u32, result: Result<StepOutput, StepError>) {
        let _ = self.signals.send(NodeSignal::Finished {
            node_id: self.node_id.clone(),
            attempts,
            result,
        });
    }
}

/// Drives one run of an [`ExecutablePlan`] to a terminal status.
///
/// Every transition is written to the store first and published second; a
/// failed write halts the run where it is.
pub(crate) struct RunScheduler {
    plan: Arc<ExecutablePlan>,
    store: Arc<dyn RunStore>,
    events: Arc<EventBus>,
    executor: NodeExecutor,
    config: RuntimeConfig,
    cancellation: CancellationToken,

    run: Run,
    working: WorkingState,
    frontier: VecDeque<NodeId>,
    activated: HashSet<NodeId>,
    running: HashMap<NodeId, NodeState>,
    statuses: HashMap<NodeId, NodeStatus>,
    /// Completed nodes that activated no successor, in completion order
    leaves: Vec<NodeId>,
    bypassed: Vec<NodeId>,
    halt: Option<Halt>,
    failure: Option<(NodeId, String)>,
}

impl RunScheduler {
    pub(crate) fn new(
        plan: Arc<ExecutablePlan>,
        store: Arc<dyn RunStore>,
        events: Arc<EventBus>,
        executor: NodeExecutor,
        config: RuntimeConfig,
        cancellation: CancellationToken,
        run: Run,
    ) -> Self {
        let working = WorkingState::new(run.input.clone());
        Self {
            plan,
            store,
            events,
            executor,
            config,
            cancellation,
            run,
            working,
            frontier: VecDeque::new(),
            activated: HashSet::new(),
            running: HashMap::new(),
            statuses: HashMap::new(),
            leaves: Vec::new(),
            bypassed: Vec::new(),
            halt: None,
            failure: None,
        }
    }

    fn fatal(&self, source: StoreError) -> EngineError {
        error!(run_id = %self.run.run_id, error = %source, "store write failed, halting run");
        EngineError::Fatal {
            run_id: self.run.run_id,
            source,
        }
    }

    pub(crate) async fn drive(mut self) -> Result<Run, EngineError> {
        let run_id = self.run.run_id;
        info!(
            run_id = %run_id,
            graph_id = %self.plan.graph_id,
            entry = %self.plan.entry,
            "starting run"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        self.activate(self.plan.entry.clone());

        loop {
            // Scheduling decision point
            self.observe_cancellation().await?;
            if self.halt.is_none() {
                self.dispatch_ready(&tx, &mut tasks).await?;
            }
            if self.running.is_empty() {
                break;
            }

            // Joined tasks are only reaped; outcomes arrive as signals.
            let signal = tokio::select! {
                signal = rx.recv() => signal,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(run_id = %run_id, error = %e, "node task aborted");
                    }
                    continue;
                }
            };
            let Some(signal) = signal else { break };
            self.handle(signal).await?;
        }

        self.observe_cancellation().await?;
        self.record_bypassed().await?;
        self.finalize().await
    }

    /// An intent seen at any point before finalization halts the run as
    /// CANCELLED, whatever the in-flight nodes go on to return.
    async fn observe_cancellation(&mut self) -> Result<(), EngineError> {
        if self.halt.is_some() || !self.cancellation.is_cancelled() {
            return Ok(());
        }
        info!(run_id = %self.run.run_id, "cancellation observed");
        self.halt = Some(Halt::Cancelled);
        self.skip_frontier().await
    }

    fn activate(&mut self, node_id: NodeId) {
        if self.activated.insert(node_id.clone()) {
            debug!(run_id = %self.run.run_id, node_id = %node_id, "node activated");
            self.frontier.push_back(node_id);
        }
    }

    /// A queued node may start once no live node can still reach it.
    fn is_ready(&self, node_id: &NodeId) -> bool {
        let blocked_by_running = self
            .running
            .keys()
            .any(|live| self.plan.is_ancestor(live, node_id));
        let blocked_by_queued = self
            .frontier
            .iter()
            .any(|queued| queued != node_id && self.plan.is_ancestor(queued, node_id));
        !blocked_by_running && !blocked_by_queued
    }

    async fn dispatch_ready(
        &mut self,
        tx: &mpsc::UnboundedSender<NodeSignal>,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), EngineError> {
        let limit = self.config.max_parallel_nodes.max(1);
        let mut index = 0;
        while index < self.frontier.len() && self.running.len() < limit {
            if !self.is_ready(&self.frontier[index]) {
                index += 1;
                continue;
            }
            let Some(node_id) = self.frontier.remove(index) else {
                break;
            };
            self.dispatch(node_id, tx, tasks).await?;
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        node_id: NodeId,
        tx: &mpsc::UnboundedSender<NodeSignal>,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), EngineError> {
        let run_id = self.run.run_id;
        if self.run.status == RunStatus::Pending {
            self.run = self
                .store
                .update_run_status(run_id, RunUpdate::status(RunStatus::Running))
                .await
                .map_err(|e| self.fatal(e))?;
            self.events
                .publish(Event::run(run_id, EventKind::RunStarted, json!({})));
        }

        let (Some(spec), Some(binding)) = (self.plan.node(&node_id), self.plan.binding(&node_id))
        else {
            // Compiled plans bind every node; nothing to run otherwise.
            warn!(run_id = %run_id, node_id = %node_id, "node missing from plan");
            return Ok(());
        };

        let state = NodeState::running(run_id, node_id.clone());
        self.store
            .set_node_state(state.clone())
            .await
            .map_err(|e| self.fatal(e))?;
        self.events.publish(Event::node(
            run_id,
            node_id.clone(),
            EventKind::NodeStarted,
            json!({ "kind": spec.kind, "attempt": 1 }),
        ));
        info!(run_id = %run_id, node_id = %node_id, kind = %spec.kind, "node started");

        let job = NodeJob {
            run_id,
            node_id: node_id.clone(),
            kind: spec.kind,
            binding: binding.clone(),
            config: spec.config.clone(),
            state: Arc::new(self.working.clone()),
            retry: spec.retry.clone().or_else(|| self.config.default_retry.clone()),
            timeout: spec
                .timeout_ms
                .map(Duration::from_millis)
                .or_else(|| self.config.default_node_timeout()),
            executor: self.executor.clone(),
            cancellation: self.cancellation.clone(),
            signals: tx.clone(),
        };
        self.statuses.insert(node_id.clone(), NodeStatus::Running);
        self.running.insert(node_id, state);
        tasks.spawn(job.run());
        Ok(())
    }

    async fn handle(&mut self, signal: NodeSignal) -> Result<(), EngineError> {
        match signal {
            NodeSignal::Progress {
                node_id,
                progress,
                message,
            } => self.on_progress(node_id, progress, message).await,
            NodeSignal::Retrying {
                node_id,
                attempt,
                max_attempts,
                error,
                delay,
            } => self.on_retry(node_id, attempt, max_attempts, error, delay).await,
            NodeSignal::Finished {
                node_id,
                attempts,
                result,
            } => {
                self.observe_cancellation().await?;
                match result {
                    Ok(output) => self.on_completed(node_id, attempts, output).await,
                    Err(error) => self.on_failed(node_id, attempts, error).await,
                }
            }
        }
    }

    async fn on_progress(
        &mut self,
        node_id: NodeId,
        progress: f64,
        message: Option<String>,
    ) -> Result<(), EngineError> {
        // Reports after the node finished are dropped.
        let Some(state) = self.running.get_mut(&node_id) else {
            return Ok(());
        };
        state.progress = progress;
        let snapshot = state.clone();
        self.store
            .set_node_state(snapshot)
            .await
            .map_err(|e| self.fatal(e))?;
        self.events.publish(Event::node(
            self.run.run_id,
            node_id,
            EventKind::NodeProgress,
            json!({ "progress": progress, "message": message }),
        ));
        Ok(())
    }

    async fn on_retry(
        &mut self,
        node_id: NodeId,
        attempt: u32,
        max_attempts: u32,
        error: StepError,
        delay: Duration,
    ) -> Result<(), EngineError> {
        let Some(state) = self.running.get_mut(&node_id) else {
            return Ok(());
        };
        warn!(
            run_id = %self.run.run_id,
            node_id = %node_id,
            attempt,
            max_attempts,
            error = %error,
            "node attempt failed, retrying in {}ms",
            delay.as_millis()
        );
        state.attempts = attempt + 1;
        state.error_history.push(error.to_string());
        let snapshot = state.clone();
        self.store
            .set_node_state(snapshot)
            .await
            .map_err(|e| self.fatal(e))?;
        self.events.publish(Event::node(
            self.run.run_id,
            node_id,
            EventKind::NodeProgress,
            json!({
                "attempt": attempt + 1,
                "max_attempts": max_attempts,
                "error": error.to_string(),
                "error_kind": error.kind(),
                "retry_in_ms": delay.as_millis() as u64,
            }),
        ));
        Ok(())
    }

    async fn on_completed(
        &mut self,
        node_id: NodeId,
        attempts: u32,
        output: StepOutput,
    ) -> Result<(), EngineError> {
        let run_id = self.run.run_id;
        let Some(mut state) = self.running.remove(&node_id) else {
            return Ok(());
        };
        state.attempts = attempts;
        state.complete(output.data.clone());
        self.store
            .set_node_state(state)
            .await
            .map_err(|e| self.fatal(e))?;
        self.statuses.insert(node_id.clone(), NodeStatus::Completed);
        self.events.publish(Event::node(
            run_id,
            node_id.clone(),
            EventKind::NodeCompleted,
            json!({
                "output": output.data,
                "branches": output.branches,
                "attempts": attempts,
            }),
        ));
        info!(run_id = %run_id, node_id = %node_id, attempts, "node completed");

        self.working.merge(&node_id, output.data, &output.branches);

        // A halted run records late results but takes no further edges.
        if self.halt.is_some() {
            return Ok(());
        }

        let mut fired = false;
        let successors = self.plan.successors(&node_id).to_vec();
        for successor in successors {
            if successor.guard.passes(&node_id, &self.working, false) {
                if let Some(target) = successor.target {
                    self.activate(target);
                    fired = true;
                }
            } else if matches!(successor.guard, EdgeGuard::Branch(_)) {
                if let Some(target) = successor.target {
                    self.bypassed.push(target);
                }
            }
        }
        if !fired {
            self.leaves.push(node_id);
        }
        Ok(())
    }

    async fn on_failed(
        &mut self,
        node_id: NodeId,
        attempts: u32,
        error: StepError,
    ) -> Result<(), EngineError> {
        let run_id = self.run.run_id;
        let Some(mut state) = self.running.remove(&node_id) else {
            return Ok(());
        };
        state.attempts = attempts;

        if error == StepError::Cancelled && self.cancellation.is_cancelled() {
            state.cancel();
            state.error = Some(error.to_string());
            self.store
                .set_node_state(state)
                .await
                .map_err(|e| self.fatal(e))?;
            self.statuses.insert(node_id.clone(), NodeStatus::Cancelled);
            self.events.publish(Event::node(
                run_id,
                node_id.clone(),
                EventKind::NodeCancelled,
                json!({ "attempts": attempts }),
            ));
            info!(run_id = %run_id, node_id = %node_id, "node cancelled");
            return Ok(());
        }

        let message = error.to_string();
        state.fail(message.clone());
        self.store
            .set_node_state(state)
            .await
            .map_err(|e| self.fatal(e))?;
        self.statuses.insert(node_id.clone(), NodeStatus::Failed);
        self.events.publish(Event::node(
            run_id,
            node_id.clone(),
            EventKind::NodeFailed,
            json!({
                "error": message,
                "error_kind": error.kind(),
                "attempts": attempts,
            }),
        ));
        error!(run_id = %run_id, node_id = %node_id, attempts, error = %message, "node failed");

        self.working.merge(
            &node_id,
            json!({ "error": message, "error_kind": error.kind() }),
            &[],
        );

        if self.halt.is_some() {
            return Ok(());
        }

        if self.plan.has_error_successor(&node_id) {
            let successors = self.plan.successors(&node_id).to_vec();
            for successor in successors {
                if successor.guard.passes(&node_id, &self.working, true) {
                    if let Some(target) = successor.target {
                        self.activate(target);
                    }
                }
            }
            debug!(run_id = %run_id, node_id = %node_id, "following error edge");
            return Ok(());
        }

        self.failure = Some((node_id, message));
        self.halt = Some(Halt::Failed);
        self.skip_frontier().await
    }

    /// Mark every queued node SKIPPED; none of them will run.
    async fn skip_frontier(&mut self) -> Result<(), EngineError> {
        while let Some(node_id) = self.frontier.pop_front() {
            let state = NodeState::skipped(self.run.run_id, node_id.clone());
            self.store
                .set_node_state(state)
                .await
                .map_err(|e| self.fatal(e))?;
            self.statuses.insert(node_id.clone(), NodeStatus::Skipped);
            debug!(run_id = %self.run.run_id, node_id = %node_id, "node skipped");
        }
        Ok(())
    }

    /// Targets of untaken conditional edges that no other path reached.
    async fn record_bypassed(&mut self) -> Result<(), EngineError> {
        if !self.config.record_bypassed_branches {
            return Ok(());
        }
        let bypassed = std::mem::take(&mut self.bypassed);
        for node_id in bypassed {
            if self.activated.contains(&node_id) || self.statuses.contains_key(&node_id) {
                continue;
            }
            let state = NodeState::skipped(self.run.run_id, node_id.clone());
            self.store
                .set_node_state(state)
                .await
                .map_err(|e| self.fatal(e))?;
            self.statuses.insert(node_id.clone(), NodeStatus::Skipped);
            debug!(run_id = %self.run.run_id, node_id = %node_id, "branch bypassed");
        }
        Ok(())
    }

    fn output(&self) -> serde_json::Value {
        match self.leaves.as_slice() {
            [] => serde_json::Value::Null,
            [single] => self
                .working
                .output_of(single)
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            many => serde_json::Value::Object(
                many.iter()
                    .map(|id| {
                        (
                            id.to_string(),
                            self.working
                                .output_of(id)
                                .cloned()
                                .unwrap_or(serde_json::Value::Null),
                        )
                    })
                    .collect(),
            ),
        }
    }

    fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for status in self.statuses.values() {
            match status {
                NodeStatus::Completed => summary.completed += 1,
                NodeStatus::Failed => summary.failed += 1,
                NodeStatus::Cancelled => summary.cancelled += 1,
                NodeStatus::Skipped => summary.skipped += 1,
                NodeStatus::Pending | NodeStatus::Running => {}
            }
        }
        summary
    }

    async fn finalize(mut self) -> Result<Run, EngineError> {
        let run_id = self.run.run_id;
        let summary = self.summary();

        let (update, kind) = match (self.halt, self.failure.take()) {
            (Some(Halt::Cancelled), _) => (
                RunUpdate::status(RunStatus::Cancelled)
                    .with_message(format!(
                        "Cancelled: {} completed, {} skipped",
                        summary.completed, summary.skipped
                    ))
                    .with_summary(summary),
                EventKind::RunCancelled,
            ),
            (_, Some((node_id, message))) => (
                RunUpdate::status(RunStatus::Failed)
                    .with_message(format!("Node '{}' failed: {}", node_id, message))
                    .with_failed_node(node_id)
                    .with_summary(summary),
                EventKind::RunFailed,
            ),
            _ => (
                RunUpdate::status(RunStatus::Completed)
                    .with_output(self.output())
                    .with_message(format!("Completed {} nodes", summary.completed))
                    .with_summary(summary),
                EventKind::RunCompleted,
            ),
        };

        let run = self
            .store
            .update_run_status(run_id, update)
            .await
            .map_err(|e| self.fatal(e))?;
        self.events.publish(Event::run(
            run_id,
            kind,
            json!({
                "status": run.status,
                "message": run.last_message,
                "failed_node": run.failed_node,
                "summary": summary,
                "output": run.output,
            }),
        ));
        info!(
            run_id = %run_id,
            status = %run.status,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            "run finished"
        );
        Ok(run)
    }
}
