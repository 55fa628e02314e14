//! CLI command definitions

use crate::core::Status;
use clap::Args;

/// Run a plan
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to plan YAML file
    #[arg(short, long)]
    pub file: String,

    /// Path to engine configuration YAML file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Account the execution is billed to
    #[arg(long, default_value = "default")]
    pub account: String,

    /// Pipeline used for admission control (defaults to the plan id)
    #[arg(long)]
    pub pipeline: Option<String>,

    /// Scripted final status for a node (node=STATUS)
    #[arg(long, value_parser = parse_outcome)]
    pub outcome: Vec<(String, Status)>,

    /// Output reported by a task node (node:key=value)
    #[arg(long, value_parser = parse_output)]
    pub output: Vec<(String, String, String)>,

    /// Issue an ABORT_ALL after this many seconds
    #[arg(long)]
    pub abort_after: Option<u64>,

    /// Don't save execution to history
    #[arg(long)]
    pub no_history: bool,

    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 600)]
    pub timeout: u64,
}

/// Validate a plan definition
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to plan YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a single execution
    #[arg(long)]
    pub execution_id: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}

/// Parse node=STATUS; the status must be final
pub fn parse_outcome(s: &str) -> Result<(String, Status), String> {
    let (node, status) = parse_key_value(s)?;
    let status: Status = status.trim().to_ascii_uppercase().parse()?;
    if !status.is_final() {
        return Err(format!("Outcome of {} must be a final status, got {}", node, status));
    }
    Ok((node, status))
}

/// Parse node:key=value
pub fn parse_output(s: &str) -> Result<(String, String, String), String> {
    let (node, pair) = s
        .split_once(':')
        .ok_or_else(|| format!("Invalid node:key=value output: {}", s))?;
    let (key, value) = parse_key_value(pair)?;
    Ok((node.to_string(), key, value))
}
