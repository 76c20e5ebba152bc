//! Anthropic Messages API client.
//!
//! Differences from the Chat Completions shape:
//! - the system prompt is a top-level `system` field
//! - tool definitions use `input_schema`
//! - tool calls are `tool_use` content blocks on the assistant turn
//! - tool results go back as `tool_result` blocks inside a `user` turn

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::LlmConfig;
use crate::error::Error;
use crate::tools::ToolDescriptor;
use crate::Result;

use super::super::message::{Message, Role, ToolCallRequest};
use super::types::{ContentBlock, MessagesResponse};
use super::{
    arguments_value, http_client, send_json, LlmClient, LlmResponse, RawMessage, RetryPolicy, Usage, TRIMMED_OPENING,
};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    model: String,
    api_key: String,
    base_url: String,
    temperature: Option<f32>,
    max_tokens: u32,
    retry: RetryPolicy,
    client: Client,
}

impl AnthropicClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config.resolve_api_key(&["ANTHROPIC_API_KEY"]).ok_or_else(|| {
            Error::Config("Anthropic API key missing: set llm.api_key or ANTHROPIC_API_KEY".to_string())
        })?;

        Ok(Self {
            model: config.model.clone(),
            api_key,
            base_url: config.resolve_base_url(Some("ANTHROPIC_BASE_URL"), ANTHROPIC_BASE_URL),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry: RetryPolicy::from_config(config),
            client: http_client(config)?,
        })
    }

    fn build_request(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Value {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": convert_messages(messages),
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.parameters}))
                .collect();
        }
        body
    }

    fn parse_response(&self, body: Value) -> Result<LlmResponse> {
        let response: MessagesResponse = serde_json::from_value(body)
            .map_err(|e| Error::Llm(format!("anthropic response malformed: {e}")))?;

        let (text, tool_calls) = normalise(&response.content)?;
        let usage = response
            .usage
            .map(|u| Usage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            })
            .unwrap_or_default();

        Ok(LlmResponse {
            text,
            tool_calls,
            finish_reason: response.stop_reason.unwrap_or_else(|| "end_turn".to_string()),
            usage,
            raw: RawMessage::new("anthropic", response.content),
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn chat(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Result<LlmResponse> {
        let body = self.build_request(messages, tools);
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .retry
            .run("anthropic", None, |_| {
                let request = self
                    .client
                    .post(&url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body);
                send_json("anthropic", request, false)
            })
            .await?;
        self.parse_response(response)
    }

    fn format_history_message(&self, raw: &RawMessage) -> Message {
        match normalise(raw.payload()) {
            Ok((text, calls)) => Message::assistant_with_tools(text, calls),
            Err(e) => {
                warn!("anthropic history message unreadable: {}", e);
                Message::assistant("")
            }
        }
    }

    fn provider(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

fn normalise(content: &Value) -> Result<(String, Vec<ToolCallRequest>)> {
    let blocks: Vec<ContentBlock> = serde_json::from_value(content.clone())?;
    let mut text = String::new();
    let mut calls = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => {
                let arguments = if input.is_null() { "{}".to_string() } else { input.to_string() };
                calls.push(ToolCallRequest::new(id, name, arguments));
            }
            ContentBlock::Other => {}
        }
    }
    Ok((text, calls))
}

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        match m.role {
            Role::System => {}
            Role::User => out.push(json!({"role": "user", "content": m.content})),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": m.content}));
                }
                for call in m.calls() {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": arguments_value(call),
                    }));
                }
                // the API rejects empty assistant turns
                if !blocks.is_empty() {
                    out.push(json!({"role": "assistant", "content": blocks}));
                }
            }
            Role::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.as_deref().unwrap_or_default(),
                    "content": m.content,
                });
                match out.last_mut() {
                    Some(prev) if is_tool_result_turn(prev) => {
                        if let Some(content) = prev["content"].as_array_mut() {
                            content.push(block);
                        }
                    }
                    _ => out.push(json!({"role": "user", "content": [block]})),
                }
            }
        }
    }

    // the first turn must come from the user
    if out.first().map_or(true, |first| first["role"] != "user") {
        out.insert(0, json!({"role": "user", "content": TRIMMED_OPENING}));
    }
    out
}

fn is_tool_result_turn(message: &Value) -> bool {
    message["role"] == "user"
        && message["content"]
            .as_array()
            .is_some_and(|blocks| blocks.iter().all(|b| b["type"] == "tool_result"))
}
