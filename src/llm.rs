//! LLM client abstraction and the OpenAI-compatible implementation.
//!
//! Both supported backends (Nebius AI Studio and OpenAI) speak the same
//! `/chat/completions` wire format, so one concrete client serves both;
//! only the endpoint, key and default model differ.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, instrument};

use crate::config::LlmConfig;

const NEBIUS_API_BASE: &str = "https://api.studio.nebius.com/v1";
const NEBIUS_DEFAULT_MODEL: &str = "Qwen/Qwen2.5-72B-Instruct";
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

/// A callable contract advertised to the model.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters: Value,
}

impl ToolDefinition {
    fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// Raw JSON string as produced by the model.
    pub arguments: String,
}

/// Tool call in the request-body encoding, used when echoing the
/// assistant's tool-call turn back into the conversation.
#[derive(Debug, Clone, Serialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: &'static str,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireFunction {
    pub name: String,
    pub arguments: String,
}

/// One entry of the conversation sent to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system",
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user",
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// The assistant turn that requested tool calls, echoed back verbatim.
    pub fn assistant_tool_calls(content: Option<String>, calls: &[ToolCallRequest]) -> Self {
        ChatMessage {
            role: "assistant",
            content,
            tool_calls: Some(
                calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        call_type: "function",
                        function: WireFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect(),
            ),
            tool_call_id: None,
        }
    }

    /// The result of one tool call, keyed by the call's identifier.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            role: "tool",
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// The assistant's reply to one completion request.
#[derive(Debug, Clone, Default)]
pub struct AssistantTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Simple LLM client interface
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Issues one completion request over the given conversation,
    /// advertising `tools` when present.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<AssistantTurn>;
}

/// Client for OpenAI-compatible chat completion APIs.
pub struct OpenAiCompatClient {
    backend: &'static str,
    api_key: String,
    model: String,
    chat_url: String,
}

impl OpenAiCompatClient {
    pub fn new(
        backend: &'static str,
        api_key: String,
        model: String,
        api_base: &str,
    ) -> Self {
        Self {
            backend,
            api_key,
            model,
            chat_url: format!("{}/chat/completions", api_base.trim_end_matches('/')),
        }
    }

    /// Selects a backend from the configured credentials: Nebius first,
    /// OpenAI as the fallback, each with its own default model
    /// identifier. Returns `None` when neither key is set.
    pub fn from_config(config: &LlmConfig) -> Option<Self> {
        if let Some(key) = &config.nebius_api_key {
            let model = config
                .nebius_model
                .clone()
                .unwrap_or_else(|| NEBIUS_DEFAULT_MODEL.to_string());
            debug!(%model, "Using Nebius LLM backend.");
            return Some(Self::new("nebius", key.clone(), model, NEBIUS_API_BASE));
        }
        if let Some(key) = &config.openai_api_key {
            let model = config
                .openai_model
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string());
            debug!(%model, "Using OpenAI LLM backend.");
            return Some(Self::new("openai", key.clone(), model, OPENAI_API_BASE));
        }
        None
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    #[instrument(skip(self, messages, tools), fields(backend = self.backend, message_count = messages.len()))]
    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<AssistantTurn> {
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            payload["tools"] = Value::Array(tools.iter().map(ToolDefinition::to_wire).collect());
            payload["tool_choice"] = Value::String("auto".to_string());
        }

        debug!("Posting chat completion request.");
        let client = reqwest::Client::new();
        let response = client
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("Failed to send request to LLM API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(%status, error_body = %error_text, "LLM API request failed.");
            return Err(anyhow!("LLM API error ({}): {}", status, error_text));
        }

        let response_json: Value = response
            .json()
            .await
            .context("Failed to parse LLM API response")?;

        parse_assistant_turn(&response_json)
    }
}

/// Extracts the assistant message from a chat completion response body.
fn parse_assistant_turn(response: &Value) -> Result<AssistantTurn> {
    let message = response
        .pointer("/choices/0/message")
        .ok_or_else(|| anyhow!("LLM response carried no choices"))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .map(String::from);

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call.get("id").and_then(Value::as_str)?;
                    let function = call.get("function")?;
                    let name = function.get("name").and_then(Value::as_str)?;
                    let arguments = function.get("arguments").and_then(Value::as_str)?;
                    Some(ToolCallRequest {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments: arguments.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(AssistantTurn {
        content,
        tool_calls,
    })
}
