use crate::{NodeId, RunId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Kind of transition an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run.created")]
    RunCreated,
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    #[serde(rename = "node.started")]
    NodeStarted,
    #[serde(rename = "node.progress")]
    NodeProgress,
    #[serde(rename = "node.completed")]
    NodeCompleted,
    #[serde(rename = "node.failed")]
    NodeFailed,
    #[serde(rename = "node.cancelled")]
    NodeCancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunCreated => "run.created",
            EventKind::RunStarted => "run.started",
            EventKind::RunCompleted => "run.completed",
            EventKind::RunFailed => "run.failed",
            EventKind::RunCancelled => "run.cancelled",
            EventKind::NodeStarted => "node.started",
            EventKind::NodeProgress => "node.progress",
            EventKind::NodeCompleted => "node.completed",
            EventKind::NodeFailed => "node.failed",
            EventKind::NodeCancelled => "node.cancelled",
        }
    }

    /// Last event a run will ever emit.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::RunCompleted | EventKind::RunFailed | EventKind::RunCancelled
        )
    }

    pub fn is_node_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::NodeCompleted | EventKind::NodeFailed | EventKind::NodeCancelled
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live notification of a committed run or node transition.
///
/// Events are not a system of record: a subscriber that missed some must
/// re-read the run state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub kind: EventKind,
    /// Per-run position, starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn run(run_id: RunId, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            run_id,
            node_id: None,
            kind,
            sequence: 0,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn node(
        run_id: RunId,
        node_id: NodeId,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            run_id,
            node_id: Some(node_id),
            kind,
            sequence: 0,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Publisher fanning events out to subscribers.
///
/// `publish` never blocks: a subscriber that falls more than the buffer
/// capacity behind loses the oldest events.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sequences: DashMap<RunId, u64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequences: DashMap::new(),
        }
    }

    /// Stamp the event with its per-run sequence number and send it.
    ///
    /// Callers publish only after the corresponding store write succeeded.
    pub fn publish(&self, mut event: Event) -> u64 {
        let sequence = {
            let mut entry = self.sequences.entry(event.run_id).or_insert(0);
            *entry += 1;
            *entry
        };
        event.sequence = sequence;
        if event.kind.is_run_terminal() {
            self.sequences.remove(&event.run_id);
        }

        tracing::trace!(
            run_id = %event.run_id,
            kind = %event.kind,
            sequence,
            "publishing event"
        );
        // No receivers is fine: events are a live channel only.
        let _ = self.sender.send(event);
        sequence
    }

    /// Every event for every run.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Events for one run, starting from now.
    pub fn subscribe_run(&self, run_id: RunId) -> RunSubscription {
        RunSubscription {
            run_id,
            receiver: self.sender.subscribe(),
            finished: false,
            missed: 0,
        }
    }

    /// Drop the sequence counter of a run that will publish nothing more.
    pub fn forget_run(&self, run_id: RunId) {
        self.sequences.remove(&run_id);
    }

    /// Runs with a live sequence counter.
    pub fn tracked_runs(&self) -> usize {
        self.sequences.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// What a [`RunSubscription`] yields.
#[derive(Debug, Clone, PartialEq)]
pub enum RunNotice {
    Event(Event),
    /// This many events were dropped; re-read the store for current state
    Lagged(u64),
}

/// Filtered view of the bus for a single run
pub struct RunSubscription {
    run_id: RunId,
    receiver: broadcast::Receiver<Event>,
    finished: bool,
    missed: u64,
}

impl RunSubscription {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Events dropped so far because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn accept(&mut self, event: Event) -> Option<RunNotice> {
        if event.run_id != self.run_id {
            return None;
        }
        if event.kind.is_run_terminal() {
            self.finished = true;
        }
        Some(RunNotice::Event(event))
    }

    fn lagged(&mut self, skipped: u64) -> RunNotice {
        tracing::warn!(run_id = %self.run_id, skipped, "subscriber lagged, events dropped");
        self.missed += skipped;
        RunNotice::Lagged(skipped)
    }

    /// Next event or gap for this run; `None` once the run's terminal event
    /// was delivered or the bus is gone.
    ///
    /// A dropped terminal event shows up only as `Lagged`, so callers
    /// waiting for the end of a run must check the store on a gap.
    pub async fn recv_notice(&mut self) -> Option<RunNotice> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(notice) = self.accept(event) {
                        return Some(notice);
                    }
                }
                Err(RecvError::Lagged(skipped)) => return Some(self.lagged(skipped)),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv_notice`](Self::recv_notice).
    pub fn try_recv_notice(&mut self) -> Option<RunNotice> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if let Some(notice) = self.accept(event) {
                        return Some(notice);
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => return Some(self.lagged(skipped)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Next event for this run, passing over gaps.
    ///
    /// Never returns if the run's terminal event was among the dropped
    /// ones and the bus stays open; use [`recv_notice`](Self::recv_notice)
    /// to notice that.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.recv_notice().await? {
                RunNotice::Event(event) => return Some(event),
                RunNotice::Lagged(_) => continue,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.try_recv_notice()? {
                RunNotice::Event(event) => return Some(event),
                RunNotice::Lagged(_) => continue,
            }
        }
    }

    /// Collect events until the run's terminal event.
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}
