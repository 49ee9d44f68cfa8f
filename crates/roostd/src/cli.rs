//! CLI argument parsing for the console runner

use clap::Parser;
use std::path::PathBuf;

/// Roost - self-organizing worker cluster console
///
/// Loads a YAML node list and runs every node in-process over the loopback
/// transport, so cluster formation, leader election and worker assignment
/// can be observed from a single terminal.
#[derive(Parser, Debug)]
#[command(name = "roostd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration with the node list
    #[arg(short, long, default_value = "config/config.yaml", env = "ROOST_CONFIG")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Replay the failover script: run, stop the first node, restart it
    #[arg(long)]
    pub failover_demo: bool,
}
