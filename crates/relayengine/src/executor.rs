use crate::compiler::StepBinding;
use crate::registry::CapabilityRegistry;
use futures::FutureExt;
use relaycore::{StepContext, StepError, StepOutput};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// Dispatch shell around a single node attempt.
///
/// Picks the step by binding, enforces the timeout and turns a panicking
/// step into an ordinary failure. It holds no step-specific logic.
#[derive(Clone)]
pub struct NodeExecutor {
    registry: Arc<CapabilityRegistry>,
}

impl NodeExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub async fn execute(
        &self,
        binding: &StepBinding,
        ctx: StepContext,
        limit: Option<Duration>,
    ) -> Result<StepOutput, StepError> {
        let step = self
            .registry
            .resolve(binding)
            .ok_or_else(|| StepError::NoCapability(binding.to_string()))?;

        let node_id = ctx.node_id.clone();
        let attempt = ctx.attempt;
        let start = Instant::now();
        let call = AssertUnwindSafe(step.execute(ctx)).catch_unwind();

        let result = match limit {
            Some(limit) => match timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(StepError::Timeout {
                        millis: limit.as_millis() as u64,
                    })
                }
            },
            None => call.await,
        };

        let result = result.unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(StepError::ExecutionFailed(format!("step panicked: {}", message)))
        });

        tracing::debug!(
            node_id = %node_id,
            attempt,
            binding = %binding,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "node attempt finished"
        );
        result
    }
}
