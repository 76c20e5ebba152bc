//! Agent loop - the orchestration state machine
//!
//! Each iteration asks the model for its next step, records the turn, and
//! dispatches any requested tool calls. The run ends when the model has been
//! idle (no tool calls) for `max_idle_turns` consecutive turns, when the
//! iteration ceiling is hit, or when the provider fails for good.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Serialize, Serializer};
use tracing::{debug, error, info, warn};

use crate::config::{LoopConfig, ToolConfig};
use crate::tools::{execute_tool, SessionHandle, ToolSessionPool};

use super::history::ConversationHistory;
use super::llm::{LlmClient, LlmResponse};
use super::message::{Message, ToolCallRequest, ToolResult};

/// Terminal state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopStatus {
    Concluded,
    MaxIter,
    Error,
}

/// Counters accumulated across the whole run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoopMetrics {
    pub iterations: usize,
    pub total_tool_calls: usize,
    pub failed_tool_calls: usize,
    #[serde(serialize_with = "seconds")]
    pub elapsed: Duration,
}

fn seconds<S: Serializer>(elapsed: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

/// Outcome of one run, built once when the loop stops
#[derive(Debug, Clone, Serialize)]
pub struct LoopResult {
    pub status: LoopStatus,
    /// Last non-empty text the model produced
    pub final_output: String,
    pub metrics: LoopMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoopResult {
    pub(crate) fn failed(error: impl Into<String>, metrics: LoopMetrics) -> Self {
        Self {
            status: LoopStatus::Error,
            final_output: String::new(),
            metrics,
            error: Some(error.into()),
        }
    }
}

/// What to do with one requested call
enum Dispatch<'p> {
    Run(&'p SessionHandle),
    Answer(ToolResult),
}

/// The agent loop drives one conversation to a terminal state
pub struct AgentLoop<'a> {
    client: &'a dyn LlmClient,
    pool: &'a ToolSessionPool,
    config: LoopConfig,
    tool_config: ToolConfig,
}

impl<'a> AgentLoop<'a> {
    /// Create a new agent loop
    pub fn new(client: &'a dyn LlmClient, pool: &'a ToolSessionPool, config: LoopConfig, tool_config: ToolConfig) -> Self {
        Self {
            client,
            pool,
            config,
            tool_config,
        }
    }

    /// Run until a terminal state. Never fails; errors end up in the result.
    pub async fn run(&self, history: &mut ConversationHistory) -> LoopResult {
        let started = Instant::now();
        let mut metrics = LoopMetrics::default();
        let mut final_output = String::new();
        let mut idle_turns = 0;
        let mut recent_calls: VecDeque<String> = VecDeque::with_capacity(self.config.repeat_window);
        let schemas = self.pool.all_tool_schemas();

        info!(
            "Starting agent loop with {} tool(s), max {} iteration(s)",
            schemas.len(),
            self.config.max_iterations
        );

        for iteration in 1..=self.config.max_iterations {
            metrics.iterations = iteration;
            debug!("Iteration {}/{}", iteration, self.config.max_iterations);

            let response = {
                let view = history.messages();
                self.client.chat(&view, schemas).await
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    error!(iteration, "Provider call failed: {}", e);
                    metrics.elapsed = started.elapsed();
                    return LoopResult {
                        status: LoopStatus::Error,
                        final_output,
                        metrics,
                        error: Some(e.to_string()),
                    };
                }
            };

            let turn = self.canonical_turn(&response);
            let calls = turn.calls().to_vec();
            history.append_assistant(turn);

            if !response.text.trim().is_empty() {
                final_output = response.text.clone();
            }

            if calls.is_empty() {
                idle_turns += 1;
                debug!("Text-only turn ({}/{} idle)", idle_turns, self.config.max_idle_turns);
                if idle_turns >= self.config.max_idle_turns {
                    metrics.elapsed = started.elapsed();
                    info!(
                        "Agent concluded after {} iteration(s), {} tool call(s) ({} failed)",
                        metrics.iterations, metrics.total_tool_calls, metrics.failed_tool_calls
                    );
                    return LoopResult {
                        status: LoopStatus::Concluded,
                        final_output,
                        metrics,
                        error: None,
                    };
                }
                continue;
            }

            idle_turns = 0;
            info!(iteration, tool_calls = calls.len(), "Dispatching tool call(s)");

            for result in self.dispatch(&calls, &mut recent_calls).await {
                metrics.total_tool_calls += 1;
                if !result.success {
                    metrics.failed_tool_calls += 1;
                }
                history.append_tool_result(&result);
            }
        }

        metrics.elapsed = started.elapsed();
        warn!(
            "Iteration ceiling reached ({}) without concluding; {} tool call(s), {} failed",
            self.config.max_iterations, metrics.total_tool_calls, metrics.failed_tool_calls
        );
        LoopResult {
            status: LoopStatus::MaxIter,
            final_output,
            metrics,
            error: None,
        }
    }

    /// History form of the turn, as produced by the client that made it.
    ///
    /// Tool results are paired by the ids in this message, so it must carry
    /// exactly the calls the response carried.
    fn canonical_turn(&self, response: &LlmResponse) -> Message {
        let turn = self.client.format_history_message(&response.raw);
        if turn.calls() == response.tool_calls.as_slice() {
            return turn;
        }
        warn!(
            "{} history message disagrees with its response; using the normalised turn",
            self.client.provider()
        );
        Message::assistant_with_tools(response.text.clone(), response.tool_calls.clone())
    }

    /// Run every call of one turn concurrently; results keep request order.
    async fn dispatch(&self, calls: &[ToolCallRequest], recent_calls: &mut VecDeque<String>) -> Vec<ToolResult> {
        let window = self.config.repeat_window;

        let plans: Vec<Dispatch<'_>> = calls
            .iter()
            .map(|call| {
                if window > 0 {
                    let signature = call.signature();
                    if recent_calls.contains(&signature) {
                        warn!("Repeated call blocked: {}", signature);
                        return Dispatch::Answer(repeated(call, window));
                    }
                    if recent_calls.len() == window {
                        recent_calls.pop_front();
                    }
                    recent_calls.push_back(signature);
                }

                match self.pool.route(&call.name) {
                    Ok(handle) => Dispatch::Run(handle),
                    Err(e) => {
                        warn!("Model requested unknown tool '{}'", call.name);
                        Dispatch::Answer(ToolResult::failure(
                            call,
                            format!(
                                "[TOOL NOT FOUND] '{}' is not an available tool. Available tools: {}",
                                call.name,
                                self.pool.tool_names().join(", ")
                            ),
                            e.to_string(),
                        ))
                    }
                }
            })
            .collect();

        let tasks = plans.into_iter().zip(calls).map(|(plan, call)| async move {
            match plan {
                Dispatch::Run(handle) => execute_tool(handle, call, &self.tool_config).await,
                Dispatch::Answer(result) => result,
            }
        });

        join_all(tasks).await
    }
}

fn repeated(call: &ToolCallRequest, window: usize) -> ToolResult {
    ToolResult::failure(
        call,
        format!(
            "[TOOL SKIPPED] '{}' was already called with these exact arguments within the last {} call(s). \
             Its result is above. Change the arguments or try a different approach.",
            call.name, window
        ),
        "repeated call",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::testing::FakeLlmClient;
    use crate::agent::message::Role;
    use crate::error::Error;
    use crate::tools::testing::{Behaviour, EventLog, FakeSession};
    use std::sync::Arc;

    async fn pool() -> ToolSessionPool {
        let session = FakeSession::new(
            "sim",
            &[
                ("read_log", Behaviour::Reply("log".into())),
                ("get_signal", Behaviour::Reply("wave".into())),
                ("flaky", Behaviour::AlwaysFail("no route".into())),
            ],
            EventLog::default(),
        );
        let mut pool = ToolSessionPool::new();
        pool.register("sim", Arc::new(session)).await.unwrap();
        pool
    }

    fn loop_config(max_iterations: usize, max_idle_turns: usize) -> LoopConfig {
        LoopConfig {
            max_iterations,
            max_idle_turns,
            ..LoopConfig::default()
        }
    }

    fn tool_config() -> ToolConfig {
        ToolConfig {
            max_retries: 2,
            retry_delay_secs: 0.001,
            call_timeout_secs: 5.0,
        }
    }

    fn history() -> ConversationHistory {
        ConversationHistory::new("You debug RTL.", "Why does the testbench hang?", 1_000_000, 4)
    }

    async fn run(client: &FakeLlmClient, config: LoopConfig) -> (LoopResult, ConversationHistory) {
        let pool = pool().await;
        let mut history = history();
        let result = AgentLoop::new(client, &pool, config, tool_config()).run(&mut history).await;
        (result, history)
    }

    #[tokio::test]
    async fn test_max_iterations_with_endless_tool_calls() {
        let client = FakeLlmClient::always(LlmResponse::call("c", "read_log", "{}"));
        let (result, _) = run(&client, loop_config(3, 1)).await;

        assert_eq!(result.status, LoopStatus::MaxIter);
        assert_eq!(result.metrics.iterations, 3);
        assert_eq!(result.metrics.total_tool_calls, 3);
        assert_eq!(result.final_output, "");
    }

    #[tokio::test]
    async fn test_concludes_after_tool_then_text() {
        let client = FakeLlmClient::new(vec![
            Ok(LlmResponse::call("c1", "read_log", r#"{"path":"sim.log"}"#)),
            Ok(LlmResponse::text_only("The FIFO read pointer never advances.")),
        ]);
        let (result, history) = run(&client, loop_config(10, 1)).await;

        assert_eq!(result.status, LoopStatus::Concluded);
        assert_eq!(result.metrics.iterations, 2);
        assert_eq!(result.final_output, "The FIFO read pointer never advances.");
        assert!(result.error.is_none());

        let raw = history.raw_messages();
        assert_eq!(raw[2].calls()[0].id, "c1");
        assert_eq!(raw[3].role, Role::Tool);
        assert_eq!(raw[3].content, "log@sim");
    }

    #[tokio::test]
    async fn test_idle_threshold_requires_consecutive_text_turns() {
        let client = FakeLlmClient::new(vec![
            Ok(LlmResponse::text_only("thinking")),
            Ok(LlmResponse::text_only("still thinking")),
            Ok(LlmResponse::call("c1", "read_log", "{}")),
            Ok(LlmResponse::text_only("one")),
            Ok(LlmResponse::text_only("two")),
            Ok(LlmResponse::text_only("three")),
        ]);
        let (result, _) = run(&client, loop_config(20, 3)).await;

        // two idle turns then a tool call must not conclude; three in a row must
        assert_eq!(result.status, LoopStatus::Concluded);
        assert_eq!(result.metrics.iterations, 6);
        assert_eq!(result.final_output, "three");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_fed_back() {
        let client = FakeLlmClient::new(vec![
            Ok(LlmResponse::call("c1", "read_waveform", "{}")),
            Ok(LlmResponse::text_only("done")),
        ]);
        let (result, history) = run(&client, loop_config(5, 1)).await;

        assert_eq!(result.status, LoopStatus::Concluded);
        assert_eq!(result.metrics.total_tool_calls, 1);
        assert_eq!(result.metrics.failed_tool_calls, 1);

        let feedback = &history.raw_messages()[3];
        assert_eq!(feedback.tool_call_id.as_deref(), Some("c1"));
        assert!(feedback.content.contains("read_waveform"));
        assert!(feedback.content.contains("get_signal, read_log"));

        // the model saw the failure on its next turn
        let second_view = &client.seen.lock().unwrap()[1];
        assert!(second_view.iter().any(|m| m.content.contains("[TOOL NOT FOUND]")));
    }

    #[tokio::test]
    async fn test_provider_error_ends_run_with_metrics() {
        let client = FakeLlmClient::new(vec![
            Ok(LlmResponse::scripted(
                "checking",
                vec![ToolCallRequest::new("c1", "flaky", "{}")],
            )),
            Err(Error::Auth("invalid key".into())),
        ]);
        let (result, history) = run(&client, loop_config(10, 1)).await;

        assert_eq!(result.status, LoopStatus::Error);
        assert!(result.error.unwrap().contains("invalid key"));
        assert_eq!(result.metrics.iterations, 2);
        assert_eq!(result.metrics.total_tool_calls, 1);
        assert_eq!(result.metrics.failed_tool_calls, 1);
        assert_eq!(result.final_output, "checking");
        // first turn and its result preserved
        assert_eq!(history.depth(), 4);
    }

    #[tokio::test]
    async fn test_parallel_calls_keep_request_order() {
        let client = FakeLlmClient::new(vec![
            Ok(LlmResponse::scripted(
                "",
                vec![
                    ToolCallRequest::new("a", "get_signal", "{}"),
                    ToolCallRequest::new("b", "flaky", "{}"),
                    ToolCallRequest::new("c", "read_log", "{}"),
                ],
            )),
            Ok(LlmResponse::text_only("ok")),
        ]);
        let (result, history) = run(&client, loop_config(5, 1)).await;

        let ids: Vec<&str> = history.raw_messages()[3..6]
            .iter()
            .map(|m| m.tool_call_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(result.metrics.total_tool_calls, 3);
        assert_eq!(result.metrics.failed_tool_calls, 1);
        assert!(result.metrics.total_tool_calls >= result.metrics.failed_tool_calls);
    }

    #[tokio::test]
    async fn test_repeat_window_blocks_identical_calls() {
        let client = FakeLlmClient::new(vec![
            Ok(LlmResponse::call("c1", "read_log", r#"{"path":"a"}"#)),
            Ok(LlmResponse::call("c2", "read_log", r#"{"path":"b"}"#)),
            Ok(LlmResponse::call("c3", "read_log", r#"{"path":"a"}"#)),
            Ok(LlmResponse::text_only("done")),
        ]);
        let config = LoopConfig {
            repeat_window: 2,
            ..loop_config(10, 1)
        };
        let (result, history) = run(&client, config).await;

        assert_eq!(result.metrics.total_tool_calls, 3);
        assert_eq!(result.metrics.failed_tool_calls, 1);
        let blocked = history
            .raw_messages()
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("c3"))
            .unwrap();
        assert!(blocked.content.starts_with("[TOOL SKIPPED]"));
    }

    #[tokio::test]
    async fn test_repeat_guard_disabled_by_default() {
        let client = FakeLlmClient::new(vec![
            Ok(LlmResponse::call("c1", "read_log", "{}")),
            Ok(LlmResponse::call("c2", "read_log", "{}")),
            Ok(LlmResponse::text_only("done")),
        ]);
        let (result, _) = run(&client, loop_config(10, 1)).await;
        assert_eq!(result.metrics.failed_tool_calls, 0);
    }

    #[tokio::test]
    async fn test_final_output_ignores_empty_text() {
        let client = FakeLlmClient::new(vec![
            Ok(LlmResponse::text_only("partial finding")),
            Ok(LlmResponse::call("c1", "read_log", "{}")),
        ]);
        let (result, _) = run(&client, loop_config(2, 5)).await;
        assert_eq!(result.status, LoopStatus::MaxIter);
        assert_eq!(result.final_output, "partial finding");
    }

    #[tokio::test]
    async fn test_tools_offered_to_model() {
        let client = FakeLlmClient::new(vec![Ok(LlmResponse::text_only("done"))]);
        run(&client, loop_config(1, 1)).await;
        let offered = client.offered.lock().unwrap().clone();
        assert_eq!(offered, vec!["read_log", "get_signal", "flaky"]);
    }

    #[test]
    fn test_result_serialises() {
        let result = LoopResult {
            status: LoopStatus::MaxIter,
            final_output: String::new(),
            metrics: LoopMetrics {
                iterations: 3,
                elapsed: Duration::from_millis(1500),
                ..LoopMetrics::default()
            },
            error: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "MAX_ITER");
        assert_eq!(json["metrics"]["elapsed"], 1.5);
        assert!(json.get("error").is_none());
    }
}
