//! rtl-agent - orchestration core for a tool-augmented LLM debugging agent
//!
//! The library asks a language model for its next step, runs the requested
//! tools on external MCP tool servers, feeds results back and decides when to
//! stop. Logs, waveforms and shell access for RTL/simulation debugging are
//! provided by those servers, not by this crate.

pub mod agent;
pub mod config;
pub mod error;
pub mod tools;

pub use error::{Error, Result};
