//! LLM client abstraction layer.
//!
//! This module provides:
//! - [`LlmClient`] trait, one implementation per wire format
//! - [`ProviderRegistry`], an explicit key → factory map
//! - [`retry`], the backoff and token-parameter policy every client shares
//!
//! # Adding a New Provider
//!
//! 1. Create a new file (e.g., `mistral.rs`)
//! 2. Implement `LlmClient`, translating [`Message`] and [`ToolDescriptor`]
//!    into the provider's wire format and back
//! 3. Register a factory with [`ProviderRegistry::register`]; the loop does
//!    not change

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod retry;
mod types;

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LlmConfig;
use crate::error::Error;
use crate::tools::ToolDescriptor;
use crate::Result;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use openai::OpenAiClient;
pub use retry::{RetryPolicy, TokenParam};

use super::message::{Message, ToolCallRequest};

/// A provider's own record of one assistant turn.
///
/// Only the client that produced it can read the payload; everyone else goes
/// through [`LlmClient::format_history_message`].
#[derive(Debug, Clone)]
pub struct RawMessage {
    provider: &'static str,
    payload: Value,
}

impl RawMessage {
    pub(crate) fn new(provider: &'static str, payload: Value) -> Self {
        Self { provider, payload }
    }

    /// Which client produced this message.
    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub(crate) fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Response from an LLM provider, normalised across wire formats.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Concatenated text of the turn, possibly empty.
    pub text: String,

    /// Tool calls requested by the LLM, in the order it issued them.
    pub tool_calls: Vec<ToolCallRequest>,

    /// Reason the response finished.
    pub finish_reason: String,

    /// Token usage statistics.
    pub usage: Usage,

    pub raw: RawMessage,
}

impl LlmResponse {
    /// Check if response has tool calls.
    #[inline]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Text and no tool calls.
    pub fn is_final(&self) -> bool {
        !self.text.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// Token usage information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// LLM client trait - swappable provider abstraction.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Ask the model for its next step.
    async fn chat(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Result<LlmResponse>;

    /// Canonical history form of a turn this client produced.
    ///
    /// Never fails: a payload the client cannot read degrades to an empty
    /// assistant message, logged as a warning.
    fn format_history_message(&self, raw: &RawMessage) -> Message;

    /// Registry key of this provider.
    fn provider(&self) -> &str;

    /// Get the default model for this provider.
    fn default_model(&self) -> &str;
}

/// Constructor stored in the registry.
pub type ProviderFactory = Box<dyn Fn(&LlmConfig) -> Result<Box<dyn LlmClient>> + Send + Sync>;

/// Provider registry - creates LLM clients by key.
///
/// # Example
///
/// ```ignore
/// let registry = ProviderRegistry::with_defaults();
/// let client = registry.create(&config.llm)?;
/// let response = client.chat(&messages, &tools).await?;
/// ```
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every built-in provider:
    /// - `"openai"`: Chat Completions
    /// - `"ollama"`, `"vllm"`: the same wire format on a local server
    /// - `"anthropic"`: Messages API
    /// - `"gemini"`: generateContent
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("openai", |cfg| Ok(Box::new(OpenAiClient::openai(cfg)?)));
        registry.register("ollama", |cfg| Ok(Box::new(OpenAiClient::ollama(cfg)?)));
        registry.register("vllm", |cfg| Ok(Box::new(OpenAiClient::vllm(cfg)?)));
        registry.register("anthropic", |cfg| Ok(Box::new(AnthropicClient::new(cfg)?)));
        registry.register("gemini", |cfg| Ok(Box::new(GeminiClient::new(cfg)?)));
        registry
    }

    /// Add or replace a provider. Keys are case-insensitive.
    pub fn register<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(&LlmConfig) -> Result<Box<dyn LlmClient>> + Send + Sync + 'static,
    {
        self.factories.insert(key.to_lowercase(), Box::new(factory));
    }

    /// Create an LLM client for `config.provider`.
    pub fn create(&self, config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
        let key = config.provider.trim().to_lowercase();
        match self.factories.get(&key) {
            Some(factory) => factory(config),
            None => Err(Error::Config(format!(
                "Unknown provider '{}'. Available: {}",
                config.provider,
                self.available().join(", ")
            ))),
        }
    }

    /// List available provider names.
    pub fn available(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// HTTP client with the configured per-request timeout.
pub(crate) fn http_client(config: &LlmConfig) -> Result<Client> {
    Ok(Client::builder().timeout(config.request_timeout()).build()?)
}

/// Send a prepared request and return the JSON body, classifying failures.
pub(crate) async fn send_json(provider: &str, request: RequestBuilder, token_param_swappable: bool) -> Result<Value> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            Error::Timeout(format!("{provider} request: {e}"))
        } else if e.is_connect() || e.is_request() {
            Error::Connection(format!("{provider} request: {e}"))
        } else {
            Error::Http(e)
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(retry::classify_status(provider, status.as_u16(), &body, token_param_swappable));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| Error::Llm(format!("{provider} returned an unreadable body: {e}")))
}

/// Parsed arguments of a canonical tool call, `{}` when they are not valid JSON.
pub(crate) fn arguments_value(call: &ToolCallRequest) -> Value {
    match serde_json::from_str::<Value>(&call.arguments) {
        Ok(v @ Value::Object(_)) => v,
        _ => Value::Object(serde_json::Map::new()),
    }
}

/// Opens a request whose original user prompt was trimmed away.
pub(crate) const TRIMMED_OPENING: &str = "(earlier conversation trimmed; continue the task)";
