//! Agent module - the orchestration core.
//!
//! This module contains:
//! - Message types shared by every component
//! - LLM client trait, provider implementations and registry
//! - Conversation history with token-budgeted views
//! - The agent loop state machine and the runner that owns one run
//!
//! # Adding a New LLM Provider
//!
//! See [`llm::ProviderRegistry`] for instructions.

pub mod history;
pub mod llm;
mod loop_impl;
pub mod message;
mod runner;
pub mod tokens;

// Re-exports for convenience
pub use history::ConversationHistory;
pub use llm::{LlmClient, LlmResponse, ProviderRegistry, RawMessage, Usage};
pub use loop_impl::{AgentLoop, LoopMetrics, LoopResult, LoopStatus};
pub use message::{Message, Role, ToolCallRequest, ToolResult};
pub use runner::{AgentRunner, RunOutcome};
