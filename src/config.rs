//! Configuration management

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::Result;
use crate::error::Error;

/// Root configuration. Every section has defaults, so an empty `{}` file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default, rename = "loop")]
    pub loop_config: LoopConfig,

    #[serde(default)]
    pub tools: ToolConfig,

    /// Tool servers, started in this order
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

/// Which model to use and how to call it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider registry key ("openai", "anthropic", "gemini", "ollama", "vllm")
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Explicit API key; falls back to the provider's environment variable
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Attempts on rate-limit / connection errors
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,

    /// Seconds; doubles each attempt
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_secs: f64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Controls how the agent loop runs and when it stops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Consecutive text-only turns required before concluding
    #[serde(default = "default_max_idle_turns")]
    pub max_idle_turns: usize,

    /// Context budget in estimated tokens (~4 chars per token)
    #[serde(default = "default_context_budget")]
    pub context_token_budget: usize,

    /// Exchange groups that always survive trimming
    #[serde(default = "default_min_recent_pairs")]
    pub min_recent_pairs: usize,

    /// Recently executed call signatures checked for repeats (0 disables)
    #[serde(default)]
    pub repeat_window: usize,
}

/// Retry behaviour for individual tool calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_tool_retries")]
    pub max_retries: u32,

    /// Seconds; multiplied by the attempt number
    #[serde(default = "default_tool_retry_delay")]
    pub retry_delay_secs: f64,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: f64,
}

/// One tool server process the agent talks to over stdio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Human-readable name used in logs
    pub label: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-5-mini".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_llm_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> f64 {
    5.0
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_iterations() -> usize {
    50
}

fn default_max_idle_turns() -> usize {
    10
}

fn default_context_budget() -> usize {
    500_000
}

fn default_min_recent_pairs() -> usize {
    8
}

fn default_tool_retries() -> u32 {
    5
}

fn default_tool_retry_delay() -> f64 {
    1.5
}

fn default_call_timeout() -> f64 {
    120.0
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            temperature: None,
            max_tokens: default_max_tokens(),
            max_retries: default_llm_retries(),
            retry_base_delay_secs: default_retry_base_delay(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_idle_turns: default_max_idle_turns(),
            context_token_budget: default_context_budget(),
            min_recent_pairs: default_min_recent_pairs(),
            repeat_window: 0,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            max_retries: default_tool_retries(),
            retry_delay_secs: default_tool_retry_delay(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl LlmConfig {
    /// Explicit key from the config, else the first non-empty env var.
    pub fn resolve_api_key(&self, env_vars: &[&str]) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| env_vars.iter().find_map(|var| non_empty_env(var)))
    }

    /// Explicit base URL, else the env var, else the given default.
    pub fn resolve_base_url(&self, env_var: Option<&str>, default: &str) -> String {
        self.base_url
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| env_var.and_then(non_empty_env))
            .unwrap_or_else(|| default.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_base_delay_secs.max(0.0))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ToolConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs.max(0.0))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.call_timeout_secs.max(0.0))
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rtl-agent")
}

/// Get the default config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration from a file
pub fn load(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        return Err(Error::Config(format!("Config not found at {:?}", path)));
    }

    let content = std::fs::read_to_string(path)?;
    let config: AgentConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from the default location, or defaults if absent
pub fn load_default() -> Result<AgentConfig> {
    let path = config_path();
    if path.exists() {
        load(&path)
    } else {
        Ok(AgentConfig::default())
    }
}

/// Save configuration to a file
pub fn save(path: &Path, config: &AgentConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

impl AgentConfig {
    /// Reject values that would make the loop meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.loop_config.max_iterations == 0 {
            return Err(Error::Config("loop.max_iterations must be at least 1".into()));
        }
        if self.loop_config.max_idle_turns == 0 {
            return Err(Error::Config("loop.max_idle_turns must be at least 1".into()));
        }
        for server in &self.mcp_servers {
            if server.command.trim().is_empty() {
                return Err(Error::Config(format!(
                    "mcp server '{}' has an empty command",
                    server.label
                )));
            }
        }
        Ok(())
    }
}
