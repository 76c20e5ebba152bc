//! Gemini generateContent client (API key authentication).
//!
//! Gemini has no tool-result message; prior calls and results are replayed as
//! plain text parts on the model and user turns.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::LlmConfig;
use crate::error::Error;
use crate::tools::ToolDescriptor;
use crate::Result;

use super::super::message::{Message, Role, ToolCallRequest};
use super::types::{Content, GeminiResponse};
use super::{http_client, send_json, LlmClient, LlmResponse, RawMessage, RetryPolicy, Usage, TRIMMED_OPENING};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Schema keywords Gemini's function declarations accept.
const SCHEMA_KEYS: &[&str] = &["type", "description", "properties", "items", "required", "enum", "format", "nullable"];

/// Gemini API client using API key authentication.
pub struct GeminiClient {
    api_key: String,
    model: String,
    base_url: String,
    temperature: Option<f32>,
    max_tokens: u32,
    retry: RetryPolicy,
    client: Client,
}

impl GeminiClient {
    /// Create a new Gemini client with API key.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .resolve_api_key(&["GOOGLE_API_KEY", "GEMINI_API_KEY"])
            .ok_or_else(|| {
                Error::Config("Gemini API key missing: set llm.api_key, GOOGLE_API_KEY or GEMINI_API_KEY".to_string())
            })?;

        Ok(Self {
            api_key,
            model: config.model.clone(),
            base_url: config.resolve_base_url(Some("GEMINI_BASE_URL"), GEMINI_BASE_URL),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry: RetryPolicy::from_config(config),
            client: http_client(config)?,
        })
    }

    fn build_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn build_request(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Value {
        let mut generation = json!({"maxOutputTokens": self.max_tokens});
        if let Some(temperature) = self.temperature {
            generation["temperature"] = json!(temperature);
        }

        let mut request = json!({
            "contents": convert_messages(messages),
            "generationConfig": generation,
        });

        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if !system.is_empty() {
            request["systemInstruction"] = json!({"parts": [{"text": system.join("\n\n")}]});
        }

        if let Some(tool_config) = convert_tools(tools) {
            request["tools"] = tool_config;
        }
        request
    }

    fn parse_response(&self, body: Value) -> Result<LlmResponse> {
        let response: GeminiResponse = serde_json::from_value(body)
            .map_err(|e| Error::Llm(format!("gemini response malformed: {e}")))?;

        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| Error::Llm("No candidates in response".to_string()))?;

        let content = candidate.content.unwrap_or_else(|| json!({"parts": []}));
        let (text, tool_calls) = normalise(&content)?;

        let usage = response
            .usage_metadata
            .map(|u| Usage {
                prompt_tokens: u.prompt_token_count.unwrap_or(0),
                completion_tokens: u.candidates_token_count.unwrap_or(0),
                total_tokens: u.total_token_count.unwrap_or(0),
            })
            .unwrap_or_default();

        Ok(LlmResponse {
            text,
            tool_calls,
            finish_reason: candidate.finish_reason.unwrap_or_else(|| "STOP".to_string()),
            usage,
            raw: RawMessage::new("gemini", content),
        })
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, messages: &[Message], tools: &[ToolDescriptor]) -> Result<LlmResponse> {
        let request = self.build_request(messages, tools);
        let url = self.build_url();

        let body = self
            .retry
            .run("gemini", None, |_| {
                let builder = self
                    .client
                    .post(&url)
                    .header("x-goog-api-key", &self.api_key)
                    .json(&request);
                send_json("gemini", builder, false)
            })
            .await?;
        self.parse_response(body)
    }

    fn format_history_message(&self, raw: &RawMessage) -> Message {
        match normalise(raw.payload()) {
            Ok((text, calls)) => Message::assistant_with_tools(text, calls),
            Err(e) => {
                warn!("gemini history message unreadable: {}", e);
                Message::assistant("")
            }
        }
    }

    fn provider(&self) -> &str {
        "gemini"
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}

/// Text and calls of a candidate's content. Call ids are derived from the
/// call's name and position, so re-reading the same payload gives the same ids.
fn normalise(content: &Value) -> Result<(String, Vec<ToolCallRequest>)> {
    let content: Content = serde_json::from_value(content.clone())?;
    let mut text = String::new();
    let mut calls = Vec::new();

    for part in content.parts {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(fc) = part.function_call {
            let arguments = if fc.args.is_null() { "{}".to_string() } else { fc.args.to_string() };
            let id = format!("gemini_{}_{}", fc.name, calls.len());
            calls.push(ToolCallRequest::new(id, fc.name, arguments));
        }
    }
    Ok((text, calls))
}

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut contents: Vec<Value> = Vec::new();

    for m in messages {
        let (role, parts): (&str, Vec<Value>) = match m.role {
            Role::System => continue,
            Role::User => ("user", vec![json!({"text": m.content})]),
            Role::Tool => {
                let header = format!(
                    "[tool_result {} ({})]",
                    m.name.as_deref().unwrap_or("tool"),
                    m.tool_call_id.as_deref().unwrap_or_default()
                );
                ("user", vec![json!({"text": format!("{header}\n{}", m.content)})])
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                if !m.content.is_empty() {
                    parts.push(json!({"text": m.content}));
                }
                for call in m.calls() {
                    parts.push(json!({"text": format!("[tool_call: {} args={}]", call.name, call.arguments)}));
                }
                ("model", parts)
            }
        };

        if parts.is_empty() {
            continue;
        }

        // Gemini wants alternating turns; merge runs of the same role
        match contents.last_mut() {
            Some(prev) if prev["role"] == role => {
                if let Some(existing) = prev["parts"].as_array_mut() {
                    existing.extend(parts);
                }
            }
            _ => contents.push(json!({"role": role, "parts": parts})),
        }
    }

    if contents.first().map_or(true, |first| first["role"] != "user") {
        contents.insert(0, json!({"role": "user", "parts": [{"text": TRIMMED_OPENING}]}));
    }
    contents
}

fn convert_tools(tools: &[ToolDescriptor]) -> Option<Value> {
    if tools.is_empty() {
        return None;
    }

    let function_declarations: Vec<Value> = tools
        .iter()
        .map(|t| {
            let mut decl = json!({"name": t.name, "description": t.description});
            let params = sanitize_schema(&t.parameters);
            let has_properties = params
                .get("properties")
                .and_then(Value::as_object)
                .is_some_and(|p| !p.is_empty());
            if has_properties {
                decl["parameters"] = params;
            }
            decl
        })
        .collect();

    Some(json!([{
        "functionDeclarations": function_declarations
    }]))
}

/// Reduce a JSON Schema to the subset Gemini accepts.
fn sanitize_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return json!({"type": "string"});
    };

    let mut out = Map::new();
    for (key, value) in obj {
        if !SCHEMA_KEYS.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "properties" => {
                let props: Map<String, Value> = value
                    .as_object()
                    .map(|p| p.iter().map(|(k, v)| (k.clone(), sanitize_schema(v))).collect())
                    .unwrap_or_default();
                out.insert(key.clone(), Value::Object(props));
            }
            "items" => {
                out.insert(key.clone(), sanitize_schema(value));
            }
            // ["string", "null"] → "string" + nullable
            "type" if value.is_array() => {
                let types: Vec<&str> = value.as_array().into_iter().flatten().filter_map(Value::as_str).collect();
                let primary = types.iter().find(|t| **t != "null").copied().unwrap_or("string");
                out.insert(key.clone(), json!(primary));
                if types.contains(&"null") {
                    out.insert("nullable".to_string(), json!(true));
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    if !out.contains_key("type") {
        let inferred = if out.contains_key("properties") { "object" } else { "string" };
        out.insert("type".to_string(), json!(inferred));
    }
    Value::Object(out)
}
