//! Core abstractions for the relay workflow engine
//!
//! This crate holds the graph model, the run and node records, the step
//! capability trait, the run state store and the event publisher. It knows
//! nothing about scheduling; that lives in `relayengine`.

mod error;
pub mod events;
mod graph;
mod run;
mod state;
mod step;
pub mod store;

pub use error::{GraphValidationError, StepError, StoreError};
pub use events::{Event, EventBus, EventKind, RunNotice, RunSubscription};
pub use graph::{
    EdgeSpec, Graph, GraphId, NodeId, NodeKind, NodeSpec, RetryPolicy, END_NODE, ERROR_LABEL,
};
pub use run::{NodeState, NodeStatus, Run, RunId, RunStatus, RunSummary, RunUpdate};
pub use state::WorkingState;
pub use step::{
    ProgressReporter, ProgressUpdate, Step, StepContext, StepMetadata, StepOutput,
};
pub use store::{InMemoryRunStore, JsonFileRunStore, RunStore};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;
