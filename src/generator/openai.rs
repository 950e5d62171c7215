//! OpenAI generation backends
//!
//! `OpenAiToolBackend` uses the Responses API with a single custom tool whose
//! output format is the Lark grammar. `OpenAiChatBackend` is the older chat
//! completions path with no grammar constraint.

use super::{BackendCapabilities, BackendOutput, GenerationBackend};
use crate::config::{BackendKind, GenerationConfig};
use crate::error::GenerationError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const TOOL_NAME: &str = "clickhouse_sql_grammar";

/// Description of the grammar tool for queries against `table`.
pub fn tool_description(table: &str) -> String {
    format!(
        "Generates read-only ClickHouse SQL queries for the {} table. \
Only SELECT statements are allowed. Always end queries with FORMAT JSON. \
Use actual SQL operators (=, !=, >, <) not terminal names. \
Use proper spacing in all statements, especially CASE WHEN expressions.",
        table
    )
}

const SYSTEM_MESSAGE: &str =
    "You are a SQL expert specializing in ClickHouse. Generate only valid SQL queries.";

/// Build the backend selected by configuration, generating for `table`.
pub fn from_config(
    config: &GenerationConfig,
    table: &str,
) -> Result<Arc<dyn GenerationBackend>, GenerationError> {
    let backend: Arc<dyn GenerationBackend> = match config.kind {
        BackendKind::Constrained => Arc::new(OpenAiToolBackend::new(
            config.api_key.clone(),
            config.model.clone(),
            config.base_url.clone(),
            tool_description(table),
            config.temperature,
            config.timeout,
        )?),
        BackendKind::Freeform => Arc::new(OpenAiChatBackend::new(
            config.api_key.clone(),
            config.model.clone(),
            config.base_url.clone(),
            config.temperature,
            config.timeout,
        )?),
    };
    Ok(backend)
}

fn http_client(timeout: Duration) -> Result<Client, GenerationError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| {
            GenerationError::BackendUnavailable(format!("Failed to create HTTP client: {}", e))
        })
}

/// POST `body` to `url` and return the parsed JSON, mapping transport
/// failures and error statuses to `BackendUnavailable`.
async fn post_json(
    client: &Client,
    url: &str,
    api_key: &str,
    body: &Value,
) -> Result<Value, GenerationError> {
    let response = client
        .post(url)
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| GenerationError::BackendUnavailable(format!("LLM API call failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(GenerationError::BackendUnavailable(format!(
            "LLM API error ({}): {}",
            status, error_text
        )));
    }

    let response_json: Value = response.json().await.map_err(|e| {
        GenerationError::BackendUnavailable(format!("Failed to parse LLM response: {}", e))
    })?;

    if let Some(error) = response_json.get("error").filter(|e| !e.is_null()) {
        return Err(GenerationError::BackendUnavailable(format!(
            "LLM API error: {}",
            error
        )));
    }

    Ok(response_json)
}

/// Grammar-constrained generation through the Responses API.
pub struct OpenAiToolBackend {
    api_key: String,
    model: String,
    base_url: String,
    description: String,
    temperature: Option<f32>,
    client: Client,
}

impl OpenAiToolBackend {
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        description: String,
        temperature: Option<f32>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            description,
            temperature,
            client: http_client(timeout)?,
        })
    }

    fn request_body(&self, prompt: &str, grammar: Option<&str>) -> Value {
        let mut body = json!({
            "model": self.model,
            "input": prompt,
            "text": {"format": {"type": "text"}},
        });
        if let Some(grammar) = grammar {
            body["tools"] = json!([{
                "type": "custom",
                "name": TOOL_NAME,
                "description": self.description,
                "format": {
                    "type": "grammar",
                    "syntax": "lark",
                    "definition": grammar,
                },
            }]);
            body["parallel_tool_calls"] = json!(false);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

/// Tool-call input if any output item carries one, else the first output text.
fn extract_responses_output(response: &Value) -> Option<BackendOutput> {
    let items = response.get("output").and_then(|o| o.as_array());

    if let Some(items) = items {
        if let Some(input) = items
            .iter()
            .find_map(|item| item.get("input").and_then(|i| i.as_str()))
        {
            return Some(BackendOutput::ToolInput(input.to_string()));
        }

        let text = items
            .iter()
            .filter_map(|item| item.get("content").and_then(|c| c.as_array()))
            .flatten()
            .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("output_text"))
            .find_map(|part| part.get("text").and_then(|t| t.as_str()))
            .filter(|t| !t.trim().is_empty());
        if let Some(text) = text {
            return Some(BackendOutput::Text(text.to_string()));
        }
    }

    response
        .get("output_text")
        .and_then(|t| t.as_str())
        .filter(|t| !t.trim().is_empty())
        .map(|t| BackendOutput::Text(t.to_string()))
}

#[async_trait]
impl GenerationBackend for OpenAiToolBackend {
    fn name(&self) -> &'static str {
        "openai-responses"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::constrained()
    }

    async fn complete(
        &self,
        prompt: &str,
        grammar: Option<&str>,
    ) -> Result<Option<BackendOutput>, GenerationError> {
        let url = format!("{}/responses", self.base_url);
        let body = self.request_body(prompt, grammar);
        let response = post_json(&self.client, &url, &self.api_key, &body).await?;

        let output = extract_responses_output(&response);
        match &output {
            Some(BackendOutput::ToolInput(_)) => info!("Received grammar tool call from {}", self.model),
            Some(BackendOutput::Text(_)) => warn!("No tool call in response from {}", self.model),
            None => warn!("Response from {} had no tool call and no text", self.model),
        }
        Ok(output)
    }
}

/// Unconstrained generation through chat completions.
pub struct OpenAiChatBackend {
    api_key: String,
    model: String,
    base_url: String,
    temperature: Option<f32>,
    client: Client,
}

impl OpenAiChatBackend {
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        temperature: Option<f32>,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            temperature,
            client: http_client(timeout)?,
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_MESSAGE},
                {"role": "user", "content": prompt}
            ],
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

fn extract_chat_output(response: &Value) -> Option<BackendOutput> {
    response
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice["message"]["content"].as_str())
        .filter(|content| !content.trim().is_empty())
        .map(|content| BackendOutput::Text(content.to_string()))
}

#[async_trait]
impl GenerationBackend for OpenAiChatBackend {
    fn name(&self) -> &'static str {
        "openai-chat"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::freeform()
    }

    async fn complete(
        &self,
        prompt: &str,
        _grammar: Option<&str>,
    ) -> Result<Option<BackendOutput>, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = post_json(&self.client, &url, &self.api_key, &self.request_body(prompt)).await?;

        if let Some(reason) = response["choices"][0]["finish_reason"].as_str() {
            if reason == "length" {
                warn!("LLM response was truncated due to length limit");
            }
        }
        Ok(extract_chat_output(&response))
    }
}
