//! Model Context Protocol client session.
//!
//! Speaks newline-delimited JSON-RPC 2.0 over any async byte stream. A single
//! background task reads responses and hands each to the request waiting on
//! its id, so several calls may be in flight on one session at once.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::McpServerConfig;
use crate::error::Error;
use crate::Result;

use super::{ContentBlock, ToolOutput, ToolSession, ToolSpec};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on any single request, including `tools/call`.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period for a child process to exit after its stdin closes.
const EXIT_GRACE: Duration = Duration::from_secs(5);

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reply = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct Pending {
    waiting: HashMap<u64, Reply>,
    closed: bool,
}

impl Pending {
    /// Mark the stream dead and fail everyone still waiting.
    fn fail_all(&mut self, label: &str) {
        self.closed = true;
        for (_, reply) in self.waiting.drain() {
            let _ = reply.send(Err(Error::Connection(format!(
                "tool server '{label}' closed the connection"
            ))));
        }
    }
}

type SharedPending = Arc<std::sync::Mutex<Pending>>;

fn lock(pending: &std::sync::Mutex<Pending>) -> MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps a request id registered while its caller waits.
///
/// Removes the id on drop, so a caller that gives up (its own timeout, a
/// cancelled future) does not leave a stale reply slot behind.
struct InFlight<'a> {
    pending: &'a std::sync::Mutex<Pending>,
    id: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.pending).waiting.remove(&self.id);
    }
}

/// A JSON-RPC session with one MCP tool server.
pub struct McpSession {
    label: String,
    writer: Mutex<Option<Writer>>,
    pending: SharedPending,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
}

impl McpSession {
    /// Attach to a server over an existing stream pair.
    pub fn connect<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::attach(label.into(), reader, writer, None)
    }

    fn attach<R, W>(label: String, reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending = Arc::new(std::sync::Mutex::new(Pending::default()));
        let task = tokio::spawn(read_loop(label.clone(), reader, Arc::clone(&pending)));

        Self {
            label,
            writer: Mutex::new(Some(Box::new(writer))),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reader: std::sync::Mutex::new(Some(task)),
            child: Mutex::new(child),
        }
    }

    /// Launch the configured server process and attach to its stdio.
    pub fn spawn(config: &McpServerConfig) -> Result<Self> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Config(format!(
                    "failed to start tool server '{}' ({}): {}",
                    config.label, config.command, e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Protocol(format!("'{}' has no stdin pipe", config.label)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Protocol(format!("'{}' has no stdout pipe", config.label)))?;

        if let Some(stderr) = child.stderr.take() {
            let label = config.label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %label, "{}", line);
                }
            });
        }

        Ok(Self::attach(config.label.clone(), stdout, stdin, Some(child)))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Connection(format!("tool server '{}' is closed", self.label)))?;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(Error::Connection(format!(
                    "tool server '{}' is closed",
                    self.label
                )));
            }
            pending.waiting.insert(id, tx);
        }
        let _in_flight = InFlight {
            pending: &self.pending,
            id,
        };

        let message = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.send(&message).await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connection(format!(
                "tool server '{}' dropped request {}",
                self.label, id
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "'{}' on '{}' after {:.1}s",
                method,
                self.label,
                self.request_timeout.as_secs_f64()
            ))),
        }
    }

    async fn notify(&self, method: &str) -> Result<()> {
        self.send(&json!({"jsonrpc": "2.0", "method": method})).await
    }
}

#[async_trait]
impl ToolSession for McpSession {
    async fn initialize(&self) -> Result<()> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
                }),
            )
            .await?;

        let server = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or(PROTOCOL_VERSION);
        info!("Tool server '{}' is '{}' (protocol {})", self.label, server, version);

        self.notify("notifications/initialized").await
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(c) => json!({"cursor": c}),
                None => json!({}),
            };
            let mut page = self.request("tools/list", params).await?;

            let batch: Vec<ToolSpec> = serde_json::from_value(page["tools"].take())
                .map_err(|e| Error::Protocol(format!("'{}' sent a bad tool list: {}", self.label, e)))?;
            tools.extend(batch);

            cursor = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }

        debug!("'{}' lists {} tool(s)", self.label, tools.len());
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;

        let blocks = result
            .get("content")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(ContentBlock::from_value).collect())
            .unwrap_or_default();
        let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);

        Ok(ToolOutput { blocks, is_error })
    }

    async fn close(&self) -> Result<()> {
        // dropping stdin is the polite shutdown request for stdio servers
        self.writer.lock().await.take();
        lock(&self.pending).fail_all(&self.label);

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("'{}' exited with {}", self.label, status),
                Ok(Err(e)) => warn!("'{}' wait failed: {}", self.label, e),
                Err(_) => {
                    warn!("'{}' did not exit in time, killing it", self.label);
                    child.kill().await?;
                }
            }
        }

        let task = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }
}

async fn read_loop<R>(label: String, reader: R, pending: SharedPending)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("'{}' read error: {}", label, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!("'{}' sent a non-JSON line ({}): {}", label, e, line);
                continue;
            }
        };

        // server-initiated requests and notifications carry a method
        if message.get("method").is_some() {
            debug!("'{}' notification ignored: {}", label, message["method"]);
            continue;
        }

        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            warn!("'{}' sent a response without a usable id: {}", label, line);
            continue;
        };

        let outcome = match message.get("error") {
            Some(err) => Err(Error::Tool(format!(
                "'{}' error {}: {}",
                label,
                err.get("code").and_then(Value::as_i64).unwrap_or(0),
                err.get("message").and_then(Value::as_str).unwrap_or("unknown error")
            ))),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };

        let reply = lock(&pending).waiting.remove(&id);
        match reply {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => debug!("'{}' answered unknown or expired request {}", label, id),
        }
    }

    lock(&pending).fail_all(&label);
    debug!("'{}' reader finished", label);
}
