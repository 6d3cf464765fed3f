use crate::compiler::{ExecutablePlan, StepBinding};
use relaycore::{GraphValidationError, NodeKind, Step, StepMetadata};
use std::collections::HashMap;
use std::sync::Arc;

/// Description of one registered capability, for listings.
#[derive(Debug, Clone)]
pub struct CapabilityInfo {
    pub kind: NodeKind,
    /// `None` for the kind's default capability
    pub handler: Option<String>,
    pub metadata: StepMetadata,
}

/// Caller-supplied map from node kind (and optional handler name) to step.
///
/// This is the only extension point for new node behaviour.
#[derive(Default)]
pub struct CapabilityRegistry {
    defaults: HashMap<NodeKind, Arc<dyn Step>>,
    handlers: HashMap<(NodeKind, String), Arc<dyn Step>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step that runs nodes of `kind` with no handler set.
    pub fn register_default(&mut self, kind: NodeKind, step: Arc<dyn Step>) {
        tracing::info!("Registering default capability for {}", kind);
        self.defaults.insert(kind, step);
    }

    /// Register a named handler, e.g. `tool-step` + `http.request`.
    pub fn register(&mut self, kind: NodeKind, handler: impl Into<String>, step: Arc<dyn Step>) {
        let handler = handler.into();
        tracing::info!("Registering capability {}:{}", kind, handler);
        self.handlers.insert((kind, handler), step);
    }

    pub fn resolve(&self, binding: &StepBinding) -> Option<Arc<dyn Step>> {
        match &binding.handler {
            Some(handler) => self.handlers.get(&(binding.kind, handler.clone())).cloned(),
            None => self.defaults.get(&binding.kind).cloned(),
        }
    }

    /// Check that every node of a plan has a capability and that each
    /// capability accepts its node's configuration.
    pub fn check_plan(&self, plan: &ExecutablePlan) -> Result<(), GraphValidationError> {
        for node_id in plan.topo_order() {
            let Some(binding) = plan.binding(node_id) else {
                continue;
            };
            let step = self
                .resolve(binding)
                .ok_or_else(|| GraphValidationError::UnknownCapability {
                    node: node_id.clone(),
                    binding: binding.to_string(),
                })?;
            if let Some(spec) = plan.node(node_id) {
                step.validate_config(&spec.config).map_err(|e| {
                    GraphValidationError::InvalidConfig {
                        node: node_id.clone(),
                        message: e.to_string(),
                    }
                })?;
            }
        }
        Ok(())
    }

    /// All registered capabilities, defaults first, sorted by name.
    pub fn list(&self) -> Vec<CapabilityInfo> {
        let mut defaults: Vec<CapabilityInfo> = self
            .defaults
            .iter()
            .map(|(kind, step)| CapabilityInfo {
                kind: *kind,
                handler: None,
                metadata: step.metadata(),
            })
            .collect();
        defaults.sort_by_key(|info| info.kind.as_str());

        let mut handlers: Vec<CapabilityInfo> = self
            .handlers
            .iter()
            .map(|((kind, handler), step)| CapabilityInfo {
                kind: *kind,
                handler: Some(handler.clone()),
                metadata: step.metadata(),
            })
            .collect();
        handlers.sort_by(|a, b| a.handler.cmp(&b.handler));

        defaults.extend(handlers);
        defaults
    }

    pub fn len(&self) -> usize {
        self.defaults.len() + self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
