//! Tool session pool - owns sessions and routes calls by tool name

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::config::McpServerConfig;
use crate::error::Error;
use crate::Result;

use super::mcp::McpSession;
use super::{ToolDescriptor, ToolOutput, ToolSession};

/// A session owned by the pool, addressed by its label.
pub struct SessionHandle {
    label: String,
    session: Arc<dyn ToolSession>,
}

impl SessionHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        self.session.call_tool(name, arguments).await
    }
}

/// Live sessions plus a unified tool registry.
///
/// Sessions are added during a single startup phase and are read-only
/// afterwards. Teardown via [`ToolSessionPool::shutdown`] closes every session
/// exactly once, newest first, including sessions whose registration failed.
#[derive(Default)]
pub struct ToolSessionPool {
    sessions: Vec<SessionHandle>,
    routes: HashMap<String, usize>,
    descriptors: Vec<ToolDescriptor>,
}

impl ToolSessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `session`, initialise it and register its tools.
    ///
    /// The session is owned by the pool before the handshake starts, so it is
    /// released at shutdown even when initialisation fails. On a name clash the
    /// first registration wins and the later tool is skipped.
    pub async fn register(&mut self, label: &str, session: Arc<dyn ToolSession>) -> Result<()> {
        let index = self.sessions.len();
        self.sessions.push(SessionHandle {
            label: label.to_string(),
            session: Arc::clone(&session),
        });

        session.initialize().await?;
        let tools = session.list_tools().await?;

        let mut added = 0;
        let mut skipped = 0;

        for tool in tools {
            if let Some(&owner) = self.routes.get(&tool.name) {
                warn!(
                    "Tool '{}' from server '{}' already registered by '{}' - skipping duplicate.",
                    tool.name, label, self.sessions[owner].label
                );
                skipped += 1;
                continue;
            }

            self.routes.insert(tool.name.clone(), index);
            self.descriptors.push(ToolDescriptor {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema,
                session: label.to_string(),
            });
            added += 1;
        }

        info!(
            "Tool server '{}' → {} tool(s) registered, {} duplicate(s) skipped.",
            label, added, skipped
        );
        Ok(())
    }

    /// Spawn and register every configured server, in order.
    ///
    /// Stops at the first failure; everything acquired so far stays owned by
    /// the pool and is released by [`Self::shutdown`].
    pub async fn connect_all(&mut self, servers: &[McpServerConfig]) -> Result<()> {
        for server in servers {
            info!(
                "Starting tool server '{}' ({} {:?})",
                server.label, server.command, server.args
            );
            let session = McpSession::spawn(server)?;
            self.register(&server.label, Arc::new(session)).await?;
        }

        info!(
            "Tool pool ready - {} tool(s) across {} server(s).",
            self.tool_count(),
            self.sessions.len()
        );
        Ok(())
    }

    /// The session that owns `name`.
    ///
    /// An unknown name is the model's mistake, reported as
    /// [`Error::ToolNotFound`] so it can be fed back rather than abort the run.
    pub fn route(&self, name: &str) -> Result<&SessionHandle> {
        match self.routes.get(name) {
            Some(&index) => Ok(&self.sessions[index]),
            None => Err(Error::ToolNotFound {
                name: name.to_string(),
                available: self.tool_names(),
            }),
        }
    }

    /// Merged schema list in registration order.
    pub fn all_tool_schemas(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    /// Sorted names of every registered tool.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tool_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Human-readable tool inventory for audit and debugging.
    pub fn catalogue(&self) -> String {
        let rule = "-".repeat(60);
        let mut out = format!("Total tools: {}\n{}\n", self.tool_count(), "=".repeat(60));

        for tool in &self.descriptors {
            let params = serde_json::to_string_pretty(&tool.parameters)
                .unwrap_or_else(|_| tool.parameters.to_string());
            let _ = write!(
                out,
                "\n[{}]\nServer      : {}\nDescription : {}\nParameters  :\n{}\n{}\n",
                tool.name, tool.session, tool.description, params, rule
            );
        }
        out
    }

    /// Close every session, newest first. Close failures are logged, not fatal.
    pub async fn shutdown(mut self) {
        while let Some(handle) = self.sessions.pop() {
            match handle.session.close().await {
                Ok(()) => info!("Tool server '{}' closed.", handle.label),
                Err(e) => warn!("Tool server '{}' failed to close cleanly: {}", handle.label, e),
            }
        }
        self.routes.clear();
        self.descriptors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{Behaviour, EventLog, FakeSession};
    use serde_json::json;

    fn reply(text: &str) -> Behaviour {
        Behaviour::Reply(text.to_string())
    }

    #[tokio::test]
    async fn test_register_and_route() {
        let mut pool = ToolSessionPool::new();
        let events = EventLog::default();
        let session = FakeSession::new("logs", &[("read_log", reply("ok")), ("grep_log", reply("hit"))], events);
        pool.register("logs", Arc::new(session)).await.unwrap();

        assert_eq!(pool.tool_count(), 2);
        assert_eq!(pool.tool_names(), vec!["grep_log", "read_log"]);
        let handle = pool.route("grep_log").unwrap();
        assert_eq!(handle.label(), "logs");
        let output = handle.call_tool("grep_log", json!({})).await.unwrap();
        assert_eq!(output.flatten().unwrap(), "hit@logs");
    }

    #[tokio::test]
    async fn test_duplicate_tool_first_registration_wins() {
        let mut pool = ToolSessionPool::new();
        let first = Arc::new(FakeSession::replying("first", "run_cmd", "a"));
        let second = Arc::new(FakeSession::replying("second", "run_cmd", "b"));

        pool.register("first", first.clone()).await.unwrap();
        pool.register("second", second.clone()).await.unwrap();

        assert_eq!(pool.tool_count(), 1);
        assert_eq!(pool.all_tool_schemas()[0].session, "first");

        let output = pool.route("run_cmd").unwrap().call_tool("run_cmd", json!({})).await.unwrap();
        assert_eq!(output.flatten().unwrap(), "a@first");
        assert_eq!(first.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_route_unknown_tool() {
        let mut pool = ToolSessionPool::new();
        pool.register("logs", Arc::new(FakeSession::replying("logs", "read_log", "x")))
            .await
            .unwrap();

        match pool.route("read_waveform") {
            Err(Error::ToolNotFound { name, available }) => {
                assert_eq!(name, "read_waveform");
                assert_eq!(available, vec!["read_log"]);
            }
            _ => panic!("expected ToolNotFound"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_reverse_order_exactly_once() {
        let events = EventLog::default();
        let mut pool = ToolSessionPool::new();
        for label in ["a", "b", "c"] {
            let session = FakeSession::new(label, &[(label, reply("x"))], events.clone());
            pool.register(label, Arc::new(session)).await.unwrap();
        }

        pool.shutdown().await;

        let closes: Vec<String> = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("close"))
            .cloned()
            .collect();
        assert_eq!(closes, vec!["close:c", "close:b", "close:a"]);
    }

    #[tokio::test]
    async fn test_failed_registration_still_released() {
        let events = EventLog::default();
        let mut pool = ToolSessionPool::new();
        pool.register("ok", Arc::new(FakeSession::new("ok", &[("t1", reply("x"))], events.clone())))
            .await
            .unwrap();

        let mut broken = FakeSession::new("broken", &[("t2", reply("y"))], events.clone());
        broken.fail_initialize = true;
        let result = pool.register("broken", Arc::new(broken)).await;
        tokio_test::assert_err!(result);
        assert_eq!(pool.tool_count(), 1);
        // recorded before the handshake, so shutdown still reaches it
        assert_eq!(pool.session_count(), 2);

        pool.shutdown().await;
        let log = events.lock().unwrap().clone();
        assert!(log.contains(&"close:broken".to_string()));
        assert!(log.contains(&"close:ok".to_string()));
    }

    #[tokio::test]
    async fn test_catalogue_lists_tools() {
        let mut pool = ToolSessionPool::new();
        pool.register("wave", Arc::new(FakeSession::replying("wave", "get_signal", "x")))
            .await
            .unwrap();
        let catalogue = pool.catalogue();
        assert!(catalogue.starts_with("Total tools: 1"));
        assert!(catalogue.contains("[get_signal]"));
        assert!(catalogue.contains("Server      : wave"));
    }
}
