//! CLI argument parsing using clap.
//!
//! Subcommands map one-to-one onto the handlers in [`crate::commands`].
//! Anything tunable beyond these flags lives in the JSON config file.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Order management and broker reconciliation for a futures account.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Set the verbosity level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub verbose: String,

    /// Path to the JSON config file; built-in defaults apply when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Flag overrides applied on top of the loaded config before the engine
/// starts.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub poll_interval_secs: Option<u64>,
    pub no_push: bool,
    pub health_port: Option<u16>,
    pub signal_file: Option<String>,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the order-management engine
    Run {
        /// Seconds between engine cycles (overrides the config)
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Disable the real-time push channel and poll over REST
        #[arg(long, default_value_t = false)]
        no_push: bool,
        /// Port for the /health and /metrics endpoint
        #[arg(long)]
        health_port: Option<u16>,
        /// File watched for strategy signals
        #[arg(long)]
        signal_file: Option<String>,
    },

    /// Place conservative protective orders for an unprotected position,
    /// then exit
    Protect,

    /// Cancel all working orders and market-close any open position
    Flatten {
        /// Skip the confirmation prompt
        #[arg(long, default_value_t = false)]
        yes: bool,
    },

    /// Show the account, position, and working-order snapshot
    Status,
}
