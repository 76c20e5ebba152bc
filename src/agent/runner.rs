//! Agent runner - one complete run with guaranteed teardown.
//!
//! Owns everything with a lifetime of one run: the provider client, the tool
//! session pool and the history. Whatever happens (provider construction
//! failure, tool server startup failure, a panic, Ctrl-C) the caller gets a
//! [`RunOutcome`] and every tool session is closed.

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::error::Error;
use crate::tools::ToolSessionPool;

use super::history::ConversationHistory;
use super::llm::{LlmClient, ProviderRegistry};
use super::loop_impl::{AgentLoop, LoopMetrics, LoopResult};
use super::message::Message;

/// Everything a reporting collaborator needs about one run
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub result: LoopResult,
    /// Full, un-trimmed message log
    pub transcript: Vec<Message>,
}

pub struct AgentRunner {
    config: AgentConfig,
    registry: ProviderRegistry,
}

impl AgentRunner {
    pub fn new(config: AgentConfig, registry: ProviderRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run the agent from a fresh history. Never fails.
    pub async fn run(&self, system_prompt: &str, user_prompt: &str) -> RunOutcome {
        let started_at = Utc::now();
        let run_id = format!("run_{}", started_at.format("%Y%m%d_%H%M%S"));
        let clock = Instant::now();

        info!(
            "Run {} starting (provider={}, model={})",
            run_id, self.config.llm.provider, self.config.llm.model
        );

        let mut history = ConversationHistory::new(
            system_prompt,
            user_prompt,
            self.config.loop_config.context_token_budget,
            self.config.loop_config.min_recent_pairs,
        );

        let client = match self.registry.create(&self.config.llm) {
            Ok(client) => client,
            Err(e) => {
                error!("Could not create LLM client: {}", e);
                return RunOutcome {
                    run_id,
                    started_at,
                    result: LoopResult::failed(e.to_string(), elapsed_only(clock)),
                    transcript: history.raw_messages().to_vec(),
                };
            }
        };

        let mut pool = ToolSessionPool::new();
        let result = {
            let work = AssertUnwindSafe(self.drive(client.as_ref(), &mut pool, &mut history)).catch_unwind();
            tokio::select! {
                outcome = work => match outcome {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!("Agent run panicked: {}", message);
                        LoopResult::failed(format!("agent panicked: {message}"), elapsed_only(clock))
                    }
                },
                _ = interrupted() => {
                    warn!("Interrupted - shutting down tool servers");
                    LoopResult::failed(Error::Interrupted.to_string(), elapsed_only(clock))
                }
            }
        };

        pool.shutdown().await;

        info!(
            "Run {} finished: {:?} after {} iteration(s) in {:.1}s ({} messages, ~{} tokens)",
            run_id,
            result.status,
            result.metrics.iterations,
            result.metrics.elapsed.as_secs_f64(),
            history.depth(),
            history.token_estimate()
        );

        RunOutcome {
            run_id,
            started_at,
            result,
            transcript: history.raw_messages().to_vec(),
        }
    }

    async fn drive(
        &self,
        client: &dyn LlmClient,
        pool: &mut ToolSessionPool,
        history: &mut ConversationHistory,
    ) -> LoopResult {
        let started = Instant::now();
        if let Err(e) = pool.connect_all(&self.config.mcp_servers).await {
            error!("Tool pool startup failed: {}", e);
            return LoopResult::failed(format!("tool pool startup failed: {e}"), elapsed_only(started));
        }

        let agent = AgentLoop::new(
            client,
            pool,
            self.config.loop_config.clone(),
            self.config.tools.clone(),
        );
        agent.run(history).await
    }
}

fn elapsed_only(since: Instant) -> LoopMetrics {
    LoopMetrics {
        elapsed: since.elapsed(),
        ..LoopMetrics::default()
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
