//! Workflow execution engine
//!
//! This crate compiles graphs into executable plans, dispatches nodes to
//! registered step capabilities and drives each run to a terminal status,
//! recording every transition in the run state store before publishing it.

mod cache;
mod compiler;
mod config;
mod engine;
mod error;
mod executor;
mod registry;
mod scheduler;

pub use cache::PlanCache;
pub use compiler::{Compiler, EdgeGuard, ExecutablePlan, StepBinding, Successor};
pub use config::RuntimeConfig;
pub use engine::WorkflowEngine;
pub use error::EngineError;
pub use executor::NodeExecutor;
pub use registry::{CapabilityInfo, CapabilityRegistry};
