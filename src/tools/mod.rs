//! Tools module - external tool-provider sessions
//!
//! Tools are not implemented in this crate. They live in external provider
//! processes (log search, waveform queries, shell wrappers) reached through a
//! [`ToolSession`]. The [`ToolSessionPool`] owns every session and routes calls
//! by tool name; the [`executor`] turns any call outcome into a [`ToolResult`].
//!
//! [`ToolResult`]: crate::agent::ToolResult

pub mod executor;
pub mod mcp;
mod pool;

pub use executor::execute_tool;
pub use mcp::McpSession;
pub use pool::{SessionHandle, ToolSessionPool};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::Result;

/// A tool as advertised by its provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for parameters
    #[serde(default = "empty_object_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

/// A registered tool, provider-agnostic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    /// Label of the session that owns this tool
    pub session: String,
}

pub(crate) fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// One block of a tool response
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Image { mime_type: String },
    Audio { mime_type: String },
    Resource { uri: String, text: Option<String> },
    Other(Value),
}

impl ContentBlock {
    /// Parse a block from its wire form. Unknown kinds are kept verbatim.
    pub fn from_value(value: &Value) -> Self {
        let str_field = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);

        match value.get("type").and_then(Value::as_str) {
            Some("text") => match str_field(value, "text") {
                Some(text) => ContentBlock::Text(text),
                None => ContentBlock::Other(value.clone()),
            },
            Some("image") => ContentBlock::Image {
                mime_type: str_field(value, "mimeType").unwrap_or_default(),
            },
            Some("audio") => ContentBlock::Audio {
                mime_type: str_field(value, "mimeType").unwrap_or_default(),
            },
            Some("resource") => {
                let resource = value.get("resource").unwrap_or(&Value::Null);
                ContentBlock::Resource {
                    uri: str_field(resource, "uri").unwrap_or_default(),
                    text: str_field(resource, "text"),
                }
            }
            _ => ContentBlock::Other(value.clone()),
        }
    }

    /// Reduce to text the model can read
    pub fn to_text(&self) -> String {
        match self {
            ContentBlock::Text(text) => text.clone(),
            ContentBlock::Image { mime_type } => format!("[image: {mime_type}]"),
            ContentBlock::Audio { mime_type } => format!("[audio: {mime_type}]"),
            ContentBlock::Resource { text: Some(text), .. } => text.clone(),
            ContentBlock::Resource { uri, text: None } => format!("[resource: {uri}]"),
            ContentBlock::Other(value) => value.to_string(),
        }
    }
}

/// Everything a provider returned for one call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub blocks: Vec<ContentBlock>,
    /// The tool ran and reported failure
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![ContentBlock::Text(text.into())],
            is_error: false,
        }
    }

    /// Newline-joined text of every block, `None` when there are no blocks.
    pub fn flatten(&self) -> Option<String> {
        if self.blocks.is_empty() {
            return None;
        }
        Some(self.blocks.iter().map(ContentBlock::to_text).collect::<Vec<_>>().join("\n"))
    }
}

/// A live connection to one external tool provider.
///
/// Implementations own their transport; the pool calls `close` exactly once.
#[async_trait]
pub trait ToolSession: Send + Sync {
    /// Perform the provider handshake
    async fn initialize(&self) -> Result<()>;

    /// Enumerate the tools this provider offers
    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;

    /// Invoke a tool with a JSON object of arguments
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput>;

    /// Release the underlying process or connection
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory sessions for pool, executor and loop tests.

    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// How a fake tool responds
    #[derive(Clone)]
    pub enum Behaviour {
        Reply(String),
        Empty,
        AlwaysFail(String),
        FailTimes(usize, String),
        ReportError(String),
        Panic,
        /// Never answers
        Stall,
    }

    /// Shared log of lifecycle events across sessions, in order.
    pub type EventLog = Arc<Mutex<Vec<String>>>;

    pub struct FakeSession {
        pub label: String,
        pub tools: Vec<(String, Behaviour)>,
        pub calls: AtomicUsize,
        pub fail_initialize: bool,
        pub events: EventLog,
    }

    impl FakeSession {
        pub fn new(label: &str, tools: &[(&str, Behaviour)], events: EventLog) -> Self {
            Self {
                label: label.to_string(),
                tools: tools.iter().map(|(n, b)| (n.to_string(), b.clone())).collect(),
                calls: AtomicUsize::new(0),
                fail_initialize: false,
                events,
            }
        }

        pub fn replying(label: &str, tool: &str, reply: &str) -> Self {
            Self::new(label, &[(tool, Behaviour::Reply(reply.to_string()))], EventLog::default())
        }

        fn record(&self, event: &str) {
            self.events.lock().unwrap().push(format!("{}:{}", event, self.label));
        }
    }

    #[async_trait]
    impl ToolSession for FakeSession {
        async fn initialize(&self) -> Result<()> {
            self.record("init");
            if self.fail_initialize {
                return Err(Error::Protocol(format!("{} refused handshake", self.label)));
            }
            Ok(())
        }

        async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
            Ok(self
                .tools
                .iter()
                .map(|(name, _)| ToolSpec {
                    name: name.clone(),
                    description: format!("{} from {}", name, self.label),
                    input_schema: empty_object_schema(),
                })
                .collect())
        }

        async fn call_tool(&self, name: &str, _arguments: Value) -> Result<ToolOutput> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.record(&format!("call {name}"));
            let behaviour = self
                .tools
                .iter()
                .find(|(tool, _)| tool == name)
                .map(|(_, b)| b.clone())
                .ok_or_else(|| Error::Tool(format!("no such tool {name}")))?;

            match behaviour {
                Behaviour::Reply(text) => Ok(ToolOutput::text(format!("{}@{}", text, self.label))),
                Behaviour::Empty => Ok(ToolOutput::default()),
                Behaviour::AlwaysFail(msg) => Err(Error::Tool(format!("{msg} #{}", n + 1))),
                Behaviour::FailTimes(times, msg) if n < times => Err(Error::Tool(msg)),
                Behaviour::FailTimes(..) => Ok(ToolOutput::text("recovered")),
                Behaviour::ReportError(msg) => Ok(ToolOutput {
                    blocks: vec![ContentBlock::Text(msg)],
                    is_error: true,
                }),
                Behaviour::Panic => panic!("transport blew up"),
                Behaviour::Stall => std::future::pending().await,
            }
        }

        async fn close(&self) -> Result<()> {
            self.record("close");
            Ok(())
        }
    }
}
