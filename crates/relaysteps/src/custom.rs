use async_trait::async_trait;
use relaycore::{Step, StepContext, StepError, StepMetadata, StepOutput};
use serde_json::Value;

/// Default `custom-step`: returns `config.output` (or the run input) and
/// selects the labels listed in `config.branch`.
pub struct PassthroughStep;

#[async_trait]
impl Step for PassthroughStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let data = ctx
            .config
            .get("output")
            .cloned()
            .unwrap_or_else(|| ctx.state.input().clone());

        let labels: Vec<String> = match ctx.config.get("branch") {
            Some(Value::String(label)) => vec![label.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(StepError::Configuration(format!(
                    "branch must be a string or list, got {}",
                    other
                )))
            }
        };

        Ok(labels
            .into_iter()
            .fold(StepOutput::new(data), |out, label| out.with_branch(label)))
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Return configured output unchanged".to_string(),
            category: "custom".to_string(),
            branches: Vec::new(),
        }
    }
}
