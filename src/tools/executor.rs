//! Resilient execution of a single tool call.
//!
//! [`execute_tool`] never fails: argument errors, provider-reported errors,
//! transport failures, timeouts and panics all come back as a [`ToolResult`]
//! the model can read.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::agent::message::{ToolCallRequest, ToolResult};
use crate::agent::tokens::truncate_chars;
use crate::config::ToolConfig;
use crate::error::Error;
use crate::Result;

use super::{SessionHandle, ToolOutput};

/// Content for a call that succeeded but returned nothing.
pub const EMPTY_RESPONSE: &str = "(tool returned empty response)";

/// Per-attempt error lines are cut to this many characters.
const TRACE_LINE_CHARS: usize = 300;

/// Parse the raw argument string into the JSON object sent to the provider.
///
/// Blank or `null` arguments mean "no arguments".
pub fn parse_arguments(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Null) => Ok(Value::Object(Map::new())),
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(Error::InvalidArguments(format!(
            "expected a JSON object, got {}",
            kind_of(&other)
        ))),
        Err(e) => Err(Error::InvalidArguments(e.to_string())),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Invoke one tool call through its owning session.
pub async fn execute_tool(session: &SessionHandle, request: &ToolCallRequest, config: &ToolConfig) -> ToolResult {
    let arguments = match parse_arguments(&request.arguments) {
        Ok(args) => args,
        Err(e) => {
            warn!("Tool '{}' called with bad arguments: {}", request.name, e);
            return ToolResult::failure(
                request,
                format!(
                    "[TOOL FAILED] '{}' was not called: {}\nRaw arguments: {}",
                    request.name,
                    e,
                    truncate_chars(&request.arguments, TRACE_LINE_CHARS)
                ),
                e.to_string(),
            );
        }
    };

    let attempts = config.max_retries.max(1);
    let mut trace: Vec<String> = Vec::new();
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        debug!(tool = %request.name, attempt, "Calling tool on '{}'", session.label());

        match attempt_call(session, &request.name, arguments.clone(), config).await {
            Ok(output) if output.is_error => {
                let text = output.flatten().unwrap_or_default();
                warn!("Tool '{}' reported an error: {}", request.name, truncate_chars(&text, TRACE_LINE_CHARS));
                return ToolResult::failure(request, render(text), "tool reported an error");
            }
            Ok(output) => {
                if attempt > 1 {
                    info!("Tool '{}' succeeded on attempt {}/{}", request.name, attempt, attempts);
                }
                return ToolResult::success(request, render(output.flatten().unwrap_or_default()));
            }
            Err(e) => {
                let message = e.to_string();
                last_error = message.clone();
                trace.push(format!(
                    "  attempt {}: {}",
                    attempt,
                    truncate_chars(&message, TRACE_LINE_CHARS)
                ));

                if attempt < attempts {
                    let delay = config.retry_delay().saturating_mul(attempt);
                    warn!(
                        "Tool '{}' attempt {}/{} failed: {}. Retrying in {:.1}s",
                        request.name,
                        attempt,
                        attempts,
                        message,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    error!("Tool '{}' failed after {} attempt(s): {}", request.name, attempts, message);
                }
            }
        }
    }

    let content = format!(
        "[TOOL FAILED] '{}' failed after {} attempt(s).\nError: {}\nAttempts:\n{}",
        request.name,
        attempts,
        last_error,
        trace.join("\n")
    );
    ToolResult::failure(request, content, last_error)
}

/// One bounded attempt; a timeout or panic counts as a failure.
async fn attempt_call(session: &SessionHandle, name: &str, arguments: Value, config: &ToolConfig) -> Result<ToolOutput> {
    let call = AssertUnwindSafe(session.call_tool(name, arguments)).catch_unwind();

    match tokio::time::timeout(config.call_timeout(), call).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(panic)) => Err(Error::Tool(format!("transport panicked: {}", panic_message(panic.as_ref())))),
        Err(_) => Err(Error::Timeout(format!(
            "'{}' exceeded {:.1}s",
            name,
            config.call_timeout().as_secs_f64()
        ))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn render(text: String) -> String {
    if text.trim().is_empty() {
        EMPTY_RESPONSE.to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{Behaviour, EventLog, FakeSession};
    use crate::tools::ToolSessionPool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_config(max_retries: u32) -> ToolConfig {
        ToolConfig {
            max_retries,
            retry_delay_secs: 0.001,
            call_timeout_secs: 5.0,
        }
    }

    async fn pool_with(behaviour: Behaviour) -> (ToolSessionPool, Arc<FakeSession>) {
        let session = Arc::new(FakeSession::new("sim", &[("run_sim", behaviour)], EventLog::default()));
        let mut pool = ToolSessionPool::new();
        pool.register("sim", session.clone()).await.unwrap();
        (pool, session)
    }

    fn call(args: &str) -> ToolCallRequest {
        ToolCallRequest::new("call_1", "run_sim", args)
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments("").unwrap(), Value::Object(Map::new()));
        assert_eq!(parse_arguments("null").unwrap(), Value::Object(Map::new()));
        assert_eq!(parse_arguments(r#"{"seed": 7}"#).unwrap()["seed"], 7);
        assert!(matches!(parse_arguments("[1, 2]"), Err(Error::InvalidArguments(_))));
        assert!(matches!(parse_arguments("{oops"), Err(Error::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn test_success() {
        let (pool, _) = pool_with(Behaviour::Reply("PASS".into())).await;
        let result = execute_tool(pool.route("run_sim").unwrap(), &call("{}"), &fast_config(3)).await;
        assert!(result.success);
        assert_eq!(result.content, "PASS@sim");
        assert_eq!(result.tool_call_id, "call_1");
    }

    #[tokio::test]
    async fn test_bad_arguments_do_not_consume_attempts() {
        let (pool, session) = pool_with(Behaviour::Reply("PASS".into())).await;
        let result = execute_tool(pool.route("run_sim").unwrap(), &call("{not json"), &fast_config(3)).await;
        assert!(!result.success);
        assert!(result.content.contains("was not called"));
        assert_eq!(session.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_always_failing_transport_exhausts_attempts() {
        let (pool, session) = pool_with(Behaviour::AlwaysFail("broken pipe".into())).await;
        let result = execute_tool(pool.route("run_sim").unwrap(), &call("{}"), &fast_config(3)).await;

        assert_eq!(session.calls.load(Ordering::SeqCst), 3);
        assert!(!result.success);
        assert!(result.content.contains("after 3 attempt(s)"));
        assert!(result.content.contains("broken pipe #3"));
        assert!(result.error.unwrap().contains("broken pipe #3"));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let (pool, session) = pool_with(Behaviour::FailTimes(2, "EAGAIN".into())).await;
        let result = execute_tool(pool.route("run_sim").unwrap(), &call("{}"), &fast_config(5)).await;
        assert!(result.success);
        assert_eq!(result.content, "recovered");
        assert_eq!(session.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_response_sentinel() {
        let (pool, _) = pool_with(Behaviour::Empty).await;
        let result = execute_tool(pool.route("run_sim").unwrap(), &call(""), &fast_config(1)).await;
        assert!(result.success);
        assert_eq!(result.content, EMPTY_RESPONSE);
    }

    #[tokio::test]
    async fn test_reported_error_is_not_retried() {
        let (pool, session) = pool_with(Behaviour::ReportError("compile failed".into())).await;
        let result = execute_tool(pool.route("run_sim").unwrap(), &call("{}"), &fast_config(4)).await;
        assert!(!result.success);
        assert_eq!(result.content, "compile failed");
        assert_eq!(session.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (pool, session) = pool_with(Behaviour::Panic).await;
        let result = execute_tool(pool.route("run_sim").unwrap(), &call("{}"), &fast_config(2)).await;
        assert!(!result.success);
        assert!(result.content.contains("transport panicked"));
        assert_eq!(session.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_linearly() {
        let (pool, session) = pool_with(Behaviour::AlwaysFail("link down".into())).await;
        let config = ToolConfig {
            max_retries: 3,
            retry_delay_secs: 1.0,
            call_timeout_secs: 30.0,
        };

        let started = tokio::time::Instant::now();
        let result = execute_tool(pool.route("run_sim").unwrap(), &call("{}"), &config).await;

        // 1s after the first failure, 2s after the second, none after the last
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert!(!result.success);
        assert_eq!(session.calls.load(Ordering::SeqCst), 3);
        assert!(result.content.contains("attempt 1: "));
        assert!(result.content.contains("attempt 3: "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_call_times_out_and_is_retried() {
        let (pool, session) = pool_with(Behaviour::Stall).await;
        let config = ToolConfig {
            max_retries: 3,
            retry_delay_secs: 1.0,
            call_timeout_secs: 2.0,
        };

        let started = tokio::time::Instant::now();
        let result = execute_tool(pool.route("run_sim").unwrap(), &call("{}"), &config).await;

        assert_eq!(session.calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3 * 2 + 1 + 2));
        assert!(!result.success);
        assert!(result.content.contains("failed after 3 attempt(s)"));
        assert_eq!(result.content.matches("exceeded 2.0s").count(), 4);
        assert!(result.error.unwrap().contains("exceeded 2.0s"));
    }
}
