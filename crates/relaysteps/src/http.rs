use crate::template::render;
use async_trait::async_trait;
use relaycore::{Step, StepContext, StepError, StepMetadata, StepOutput};
use serde_json::{json, Map, Value};

/// HTTP request step (`tool-step` handler `http.request`)
///
/// `url`, string header values and a string `body` are rendered as
/// templates against the working state. Non-2xx responses fail the node so
/// the retry policy applies.
pub struct HttpRequestStep {
    client: reqwest::Client,
}

impl HttpRequestStep {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestStep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Step for HttpRequestStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let url_template = ctx
            .config_str("url")
            .ok_or_else(|| StepError::Configuration("Missing config: url".to_string()))?;
        let url = render(url_template, &ctx.state)?;
        let method = ctx.config_str("method").unwrap_or("GET").to_uppercase();

        tracing::info!(node_id = %ctx.node_id, "{} {}", method, url);

        let mut request = match method.as_str() {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "PATCH" => self.client.patch(&url),
            "DELETE" => self.client.delete(&url),
            _ => {
                return Err(StepError::Configuration(format!(
                    "Unsupported method: {}",
                    method
                )))
            }
        };

        if let Some(Value::Object(headers)) = ctx.config.get("headers") {
            for (key, value) in headers {
                if let Some(val_str) = value.as_str() {
                    request = request.header(key, render(val_str, &ctx.state)?);
                }
            }
        }

        match ctx.config.get("body") {
            Some(Value::String(text)) => request = request.body(render(text, &ctx.state)?),
            Some(Value::Null) | None => {}
            Some(body) => request = request.json(body),
        }

        let response = request
            .send()
            .await
            .map_err(|e| StepError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or("").to_string()),
                )
            })
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| StepError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        tracing::debug!(node_id = %ctx.node_id, "Response status: {}", status);

        if !status.is_success() {
            return Err(StepError::ExecutionFailed(format!(
                "{} {} returned {}",
                method, url, status
            )));
        }

        let body_json = serde_json::from_str::<Value>(&body_text).ok();
        Ok(StepOutput::new(json!({
            "status": status.as_u16(),
            "body": body_text,
            "json": body_json,
            "headers": headers,
        })))
    }

    fn validate_config(&self, config: &Value) -> Result<(), StepError> {
        match config.get("url").and_then(Value::as_str) {
            Some(_) => Ok(()),
            None => Err(StepError::Configuration("Missing config: url".to_string())),
        }
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Make HTTP requests".to_string(),
            category: "http".to_string(),
            branches: Vec::new(),
        }
    }
}
