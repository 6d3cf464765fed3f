//! Standard step library
//!
//! Built-in capabilities for the four node kinds. Callers can register
//! their own steps next to these or instead of them.

mod condition;
mod custom;
mod http;
mod llm;
mod template;
mod tools;

pub use condition::{ConditionRule, ConditionStep, RuleOp};
pub use custom::PassthroughStep;
pub use http::HttpRequestStep;
pub use llm::{ChatModel, ChatRequest, EchoChatModel, LlmStep, OpenAiChatModel};
pub use template::render;
pub use tools::{DebugStep, DelayStep, JsonParseStep, JsonStringifyStep};

use relaycore::NodeKind;
use relayengine::CapabilityRegistry;
use std::sync::Arc;

/// Register every built-in step, using `model` for llm-step nodes
pub fn register_all(registry: &mut CapabilityRegistry, model: Arc<dyn ChatModel>) {
    registry.register_default(NodeKind::Condition, Arc::new(ConditionStep));
    registry.register_default(NodeKind::Custom, Arc::new(PassthroughStep));
    registry.register_default(NodeKind::Llm, Arc::new(LlmStep::new(model)));

    registry.register(NodeKind::Tool, "time.delay", Arc::new(DelayStep));
    registry.register(NodeKind::Tool, "debug.log", Arc::new(DebugStep));
    registry.register(NodeKind::Tool, "transform.json_parse", Arc::new(JsonParseStep));
    registry.register(NodeKind::Tool, "transform.json_stringify", Arc::new(JsonStringifyStep));
    registry.register(NodeKind::Tool, "http.request", Arc::new(HttpRequestStep::new()));
}

/// Registry with all built-ins; llm-step nodes echo their prompt
pub fn default_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    register_all(&mut registry, Arc::new(EchoChatModel));
    registry
}
