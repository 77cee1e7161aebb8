//! CLI command definitions for the `weft` binary.

pub mod render;
pub mod run;
pub mod schema;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Run and validate workflow graphs.
#[derive(Parser)]
#[command(name = "weft", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Engine configuration file (defaults to ~/.weft/config.toml).
    #[arg(long, global = true, env = "WEFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log line format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    pub log_format: LogFormatArg,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow file.
    Run(run::RunArgs),

    /// Check a workflow file for structural errors and missing tools.
    Validate {
        /// Path to a `.json`, `.yaml` or `.yml` workflow file.
        file: PathBuf,

        /// Directory of workflows available to sub-workflow blocks.
        #[arg(long)]
        workflows: Option<PathBuf>,
    },

    /// Print the JSON Schema of the workflow definition format.
    Schema,
}
