//! OpenAI Chat Completions client, also used for Ollama and vLLM.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::Error;
use crate::tools::ToolDescriptor;
use crate::Result;

use super::super::message::{Message, Role, ToolCallRequest};
use super::types::{ChatCompletion, ChatMessage};
use super::{http_client, send_json, LlmClient, LlmResponse, RawMessage, RetryPolicy, TokenParam, Usage};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const VLLM_BASE_URL: &str = "http://localhost:8000/v1";

/// Client for any server speaking the Chat Completions wire format.
pub struct OpenAiClient {
    provider: &'static str,
    model: String,
    api_key: Option<String>,
    base_url: String,
    temperature: Option<f32>,
    max_tokens: u32,
    token_param: TokenParam,
    retry: RetryPolicy,
    client: Client,
}

impl OpenAiClient {
    /// api.openai.com; requires a key.
    pub fn openai(config: &LlmConfig) -> Result<Self> {
        let api_key = config.resolve_api_key(&["OPENAI_API_KEY"]).ok_or_else(|| {
            Error::Config("OpenAI API key missing: set llm.api_key or OPENAI_API_KEY".to_string())
        })?;
        Self::build(
            "openai",
            config,
            Some(api_key),
            config.resolve_base_url(Some("OPENAI_BASE_URL"), OPENAI_BASE_URL),
            TokenParam::MaxCompletionTokens,
        )
    }

    /// Local Ollama server; no key needed.
    pub fn ollama(config: &LlmConfig) -> Result<Self> {
        Self::build(
            "ollama",
            config,
            config.resolve_api_key(&[]),
            config.resolve_base_url(Some("OLLAMA_BASE_URL"), OLLAMA_BASE_URL),
            TokenParam::MaxTokens,
        )
    }

    /// vLLM server; the key is optional and only sent when present.
    pub fn vllm(config: &LlmConfig) -> Result<Self> {
        Self::build(
            "vllm",
            config,
            config.resolve_api_key(&["VLLM_API_KEY"]),
            config.resolve_base_url(Some("VLLM_BASE_URL"), VLLM_BASE_URL),
            TokenParam::MaxTokens,
        )
    }

    fn build(
        provider: &'static str,
        config: &LlmConfig,
        api_key: Option<String>,
        base_url: String,
        token_param: TokenParam,
    ) -> Result<Self> {
        debug!("{} client → {} (model {})", provider, base_url, config.model);
        Ok(Self {
            provider,
            model: config.model.clone(),
            api_key,
            base_url,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            token_param,
            retry: RetryPolicy::from_config(config),
            client: http_client(config)?,
        })
    }

    fn build_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request(&self, messages: &[Message], tools: &[ToolDescriptor], token_param: TokenParam) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": convert_messages(messages),
        });
        body[token_param.key()] = json!(self.max_tokens);
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if !tools.is_empty() {
            body["tools"] = convert_tools(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<Value> {
        let mut request = self.client.post(self.build_url()).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        send_json(self.provider, request, true).await
    }

    fn parse_response(&self, body: Value) -> Result<LlmResponse> {
        let completion: ChatCompletion = serde_json::from_value(body)
            .map_err(|e| Error::Llm(format!("{} response malformed: {}", self.provider, e)))?;

        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Llm(format!("{} returned no choices", self.provider)))?;

        let (text, tool_calls) = normalise(&choice.message)?;
        let usage = completion
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(LlmResponse {
            text,
            tool_calls,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage,
            raw: RawMessage::new(self.provider, choice.message),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Result<LlmResponse> {
        let body = self
            .retry
            .run(self.provider, Some(self.token_param), |param| {
                let request = self.build_request(messages, tools, param);
                async move { self.post(&request).await }
            })
            .await?;
        self.parse_response(body)
    }

    fn format_history_message(&self, raw: &RawMessage) -> Message {
        match normalise(raw.payload()) {
            Ok((text, calls)) => Message::assistant_with_tools(text, calls),
            Err(e) => {
                warn!("{} history message unreadable: {}", self.provider, e);
                Message::assistant("")
            }
        }
    }

    fn provider(&self) -> &str {
        self.provider
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

/// Text and tool calls of an assistant message in Chat Completions form.
fn normalise(message: &Value) -> Result<(String, Vec<ToolCallRequest>)> {
    let parsed: ChatMessage = serde_json::from_value(message.clone())?;

    let calls = parsed
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, call)| {
            let arguments = match call.function.arguments {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            let id = if call.id.is_empty() { format!("call_{i}") } else { call.id };
            ToolCallRequest::new(id, call.function.name, arguments)
        })
        .collect();

    Ok((parsed.content.unwrap_or_default(), calls))
}

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::System => json!({"role": "system", "content": m.content}),
            Role::User => json!({"role": "user", "content": m.content}),
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id.as_deref().unwrap_or_default(),
                "content": m.content,
            }),
            Role::Assistant if m.has_tool_calls() => {
                let calls: Vec<Value> = m
                    .calls()
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {"name": tc.name, "arguments": tc.arguments},
                        })
                    })
                    .collect();
                let content = if m.content.is_empty() { Value::Null } else { json!(m.content) };
                json!({"role": "assistant", "content": content, "tool_calls": calls})
            }
            Role::Assistant => json!({"role": "assistant", "content": m.content}),
        })
        .collect()
}

fn convert_tools(tools: &[ToolDescriptor]) -> Value {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}
