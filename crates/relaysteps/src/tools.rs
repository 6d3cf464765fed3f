use crate::template::render;
use async_trait::async_trait;
use relaycore::{Step, StepContext, StepError, StepMetadata, StepOutput};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};

/// Delay execution for a specified duration, reporting progress as it goes
pub struct DelayStep;

const DELAY_TICKS: u64 = 4;

#[async_trait]
impl Step for DelayStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let delay_ms = ctx
            .config
            .get("delay_ms")
            .and_then(Value::as_u64)
            .unwrap_or(1000);
        let tick = Duration::from_millis(delay_ms / DELAY_TICKS);

        for i in 1..=DELAY_TICKS {
            tokio::select! {
                _ = sleep(tick) => {}
                _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
            }
            ctx.progress
                .report(i as f64 / DELAY_TICKS as f64, Some(format!("waited {}/{}", i, DELAY_TICKS)));
        }

        Ok(StepOutput::new(json!({ "delayed_ms": delay_ms })))
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            branches: Vec::new(),
        }
    }
}

/// Logs a rendered message and the keys of the working state
pub struct DebugStep;

#[async_trait]
impl Step for DebugStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let message = ctx
            .config_str("message")
            .map(|template| render(template, &ctx.state))
            .transpose()?
            .unwrap_or_else(|| "(no message)".to_string());

        tracing::info!(run_id = %ctx.run_id, node_id = %ctx.node_id, "DEBUG: {}", message);
        for key in ctx.state.keys() {
            tracing::debug!(node_id = %ctx.node_id, "  state key: {}", key);
        }

        Ok(StepOutput::new(json!({ "message": message })))
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Logs a message for debugging".to_string(),
            category: "debug".to_string(),
            branches: Vec::new(),
        }
    }
}

/// Parse a JSON string found at `config.source` in the working state
pub struct JsonParseStep;

#[async_trait]
impl Step for JsonParseStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let path = ctx
            .config_str("source")
            .ok_or_else(|| StepError::Configuration("Missing config: source".to_string()))?;
        let input = ctx.require_input(path)?.as_str().ok_or_else(|| {
            StepError::ExecutionFailed(format!("value at '{}' is not a string", path))
        })?;

        let parsed: Value = serde_json::from_str(input)
            .map_err(|e| StepError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(StepOutput::new(json!({ "parsed": parsed })))
    }

    fn validate_config(&self, config: &Value) -> Result<(), StepError> {
        match config.get("source").and_then(Value::as_str) {
            Some(_) => Ok(()),
            None => Err(StepError::Configuration("Missing config: source".to_string())),
        }
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Parse JSON string".to_string(),
            category: "transform".to_string(),
            branches: Vec::new(),
        }
    }
}

/// Serialize the value at `config.source` to a JSON string
pub struct JsonStringifyStep;

#[async_trait]
impl Step for JsonStringifyStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let path = ctx.config_str("source").unwrap_or("input");
        let value = ctx.require_input(path)?;

        let json_str = serde_json::to_string_pretty(value)
            .map_err(|e| StepError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(StepOutput::new(json!({ "json": json_str })))
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Convert value to JSON string".to_string(),
            category: "transform".to_string(),
            branches: Vec::new(),
        }
    }
}
