//! Anthropic `/v1/messages` provider.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ChatTurn, Completion, LlmClient, LlmError, PlanRequest, Role, ToolCallRequest};

const API_BASE: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 2_048;

/// Anthropic messages API client.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    /// Create a client for the given key and model.
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn plan(&self, request: &PlanRequest) -> Result<Completion, LlmError> {
        let messages: Vec<Value> = request.transcript.iter().map(turn_to_message).collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": request.system,
            "messages": messages,
        });

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameter_schema,
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }

        let response = self
            .client
            .post(API_BASE)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Transport(format!("status {status}: {detail}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Protocol(e.to_string()))?;

        parse_content(&payload)
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

fn turn_to_message(turn: &ChatTurn) -> Value {
    let role = match turn.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    json!({ "role": role, "content": turn.content })
}

/// Fold the response content blocks into a [`Completion`].
fn parse_content(payload: &Value) -> Result<Completion, LlmError> {
    let blocks = payload
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| LlmError::Protocol("missing content array".to_owned()))?;

    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    text_parts.push(text);
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| LlmError::Protocol("tool_use without name".to_owned()))?;
                let args = block.get("input").cloned().unwrap_or(Value::Null);
                tool_calls.push(ToolCallRequest {
                    name: name.to_owned(),
                    args,
                });
            }
            _ => {}
        }
    }

    let text = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.join(""))
    };

    Ok(Completion { text, tool_calls })
}
