use crate::template::render;
use async_trait::async_trait;
use relaycore::{Step, StepContext, StepError, StepMetadata, StepOutput};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// One prompt sent to a chat model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: Option<f64>,
}

/// Backend that turns a prompt into a completion.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<String, StepError>;

    fn name(&self) -> &str;
}

/// Offline model that answers with the prompt itself.
pub struct EchoChatModel;

#[async_trait]
impl ChatModel for EchoChatModel {
    async fn complete(&self, request: ChatRequest) -> Result<String, StepError> {
        Ok(request.prompt)
    }

    fn name(&self) -> &str {
        "echo"
    }
}

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI-compatible chat completions backend.
pub struct OpenAiChatModel {
    api_key: String,
    base_url: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Reads `OPENAI_API_KEY`, plus optional `OPENAI_BASE_URL` and `OPENAI_MODEL`.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        let mut model = Self::new(api_key);
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            model.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Ok(default_model) = std::env::var("OPENAI_MODEL") {
            model.default_model = default_model;
        }
        Some(model)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn build_headers(&self) -> Result<HeaderMap, StepError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| StepError::Configuration(e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn build_payload(&self, request: &ChatRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": request.prompt }));

        let mut payload = json!({
            "model": request.model.as_deref().unwrap_or(&self.default_model),
            "messages": messages,
        });
        if let Some(temp) = request.temperature {
            payload["temperature"] = json!(temp);
        }
        payload
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, request: ChatRequest) -> Result<String, StepError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.build_headers()?)
            .json(&self.build_payload(&request))
            .send()
            .await
            .map_err(|e| StepError::ExecutionFailed(format!("chat request failed: {}", e)))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| StepError::ExecutionFailed(format!("invalid chat response: {}", e)))?;
        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(StepError::ExecutionFailed(format!(
                "chat API returned {}: {}",
                status, message
            )));
        }

        body.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StepError::ExecutionFailed("chat response had no content".to_string()))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Default `llm-step`: renders `config.prompt` and asks the model.
///
/// Output is `{"text": ..}`, plus `"json"` when the answer parses as JSON.
/// If `config.select_branch` lists labels, the first one found in the
/// answer (case-insensitive) is selected.
pub struct LlmStep {
    model: Arc<dyn ChatModel>,
}

impl LlmStep {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

fn pick_label(text: &str, labels: &[String]) -> Option<String> {
    let lowered = text.to_lowercase();
    labels
        .iter()
        .find(|label| lowered.contains(&label.to_lowercase()))
        .cloned()
}

#[async_trait]
impl Step for LlmStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let template = ctx
            .config_str("prompt")
            .ok_or_else(|| StepError::Configuration("Missing config: prompt".to_string()))?;

        let request = ChatRequest {
            model: ctx.config_str("model").map(str::to_string),
            system: ctx
                .config_str("system")
                .map(|s| render(s, &ctx.state))
                .transpose()?,
            prompt: render(template, &ctx.state)?,
            temperature: ctx.config.get("temperature").and_then(Value::as_f64),
        };
        tracing::debug!(node_id = %ctx.node_id, model = self.model.name(), "sending prompt");

        let text = tokio::select! {
            result = self.model.complete(request) => result?,
            _ = ctx.cancellation.cancelled() => return Err(StepError::Cancelled),
        };

        let mut data = json!({ "text": text });
        if let Ok(parsed) = serde_json::from_str::<Value>(text.trim()) {
            data["json"] = parsed;
        }

        let labels: Vec<String> = ctx
            .config
            .get("select_branch")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut output = StepOutput::new(data);
        if !labels.is_empty() {
            let label = pick_label(&text, &labels).ok_or_else(|| {
                StepError::ExecutionFailed(format!(
                    "model answer matched none of {:?}",
                    labels
                ))
            })?;
            output = output.with_branch(label);
        }
        Ok(output)
    }

    fn validate_config(&self, config: &Value) -> Result<(), StepError> {
        match config.get("prompt").and_then(Value::as_str) {
            Some(_) => Ok(()),
            None => Err(StepError::Configuration("Missing config: prompt".to_string())),
        }
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: format!("Prompt the {} chat model", self.model.name()),
            category: "llm".to_string(),
            branches: Vec::new(),
        }
    }
}
