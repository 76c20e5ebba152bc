//! rtl-agent CLI entry point

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rtl_agent::agent::{AgentRunner, LoopStatus, ProviderRegistry};
use rtl_agent::config::{self, AgentConfig};
use rtl_agent::tools::ToolSessionPool;

#[derive(Parser)]
#[command(name = "rtl-agent")]
#[command(about = "Tool-augmented LLM agent for RTL and simulation debugging")]
#[command(version)]
struct Cli {
    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent on one goal
    Run {
        /// Config file (defaults to ~/.rtl-agent/config.json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// System prompt text
        #[arg(long)]
        system_prompt: String,

        /// Goal for the agent
        #[arg(long)]
        user_prompt: String,

        /// Override llm.provider
        #[arg(long)]
        provider: Option<String>,

        /// Override llm.model
        #[arg(long)]
        model: Option<String>,

        /// Override loop.max_iterations
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Write the run outcome and full transcript as JSON
        #[arg(long)]
        transcript: Option<PathBuf>,
    },

    /// Start the configured tool servers and print their tool catalogue
    Tools {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List registered LLM providers
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            config,
            system_prompt,
            user_prompt,
            provider,
            model,
            max_iterations,
            transcript,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(provider) = provider {
                config.llm.provider = provider;
            }
            if let Some(model) = model {
                config.llm.model = model;
            }
            if let Some(max_iterations) = max_iterations {
                config.loop_config.max_iterations = max_iterations;
            }
            config.validate()?;

            let runner = AgentRunner::new(config, ProviderRegistry::with_defaults());
            let outcome = runner.run(&system_prompt, &user_prompt).await;

            if let Some(path) = transcript {
                let json = serde_json::to_string_pretty(&outcome)?;
                std::fs::write(&path, json)
                    .with_context(|| format!("writing transcript to {}", path.display()))?;
                println!("Transcript: {}", path.display());
            }

            let result = &outcome.result;
            let llm = &runner.config().llm;
            println!("Run:        {}", outcome.run_id);
            println!("Provider:   {} ({})", llm.provider, llm.model);
            println!("Status:     {:?}", result.status);
            println!("Iterations: {}", result.metrics.iterations);
            println!(
                "Tool calls: {} ({} failed)",
                result.metrics.total_tool_calls, result.metrics.failed_tool_calls
            );
            println!("Elapsed:    {:.1}s", result.metrics.elapsed.as_secs_f64());
            if let Some(error) = &result.error {
                println!("Error:      {}", error);
            }
            if !result.final_output.is_empty() {
                println!("\n{}", result.final_output);
            }

            if result.status == LoopStatus::Error {
                std::process::exit(1);
            }
        }

        Commands::Tools { config } => {
            let config = load_config(config.as_deref())?;
            let mut pool = ToolSessionPool::new();
            let connected = pool.connect_all(&config.mcp_servers).await;
            if connected.is_ok() {
                println!(
                    "{} tool(s) from {} server(s)\n",
                    pool.tool_count(),
                    pool.session_count()
                );
                println!("{}", pool.catalogue());
            }
            pool.shutdown().await;
            connected?;
        }

        Commands::Providers => {
            for key in ProviderRegistry::with_defaults().available() {
                println!("{}", key);
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<AgentConfig> {
    let config = match path {
        Some(path) => config::load(path)?,
        None => config::load_default()?,
    };
    Ok(config)
}
