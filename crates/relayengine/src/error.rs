use relaycore::{GraphId, GraphValidationError, RunId, StoreError};
use thiserror::Error;

/// Errors surfaced to callers of the engine.
///
/// Node failures are never reported here; they end up in the run record.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid graph: {0}")]
    Validation(#[from] GraphValidationError),

    #[error("Graph not found: {0}")]
    GraphNotFound(GraphId),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    /// The store failed mid-run; the run stays at its last committed state.
    #[error("Run {run_id} halted, store write failed: {source}")]
    Fatal {
        run_id: RunId,
        #[source]
        source: StoreError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Fatal { .. })
    }
}
