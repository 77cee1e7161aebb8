//! Weft command-line entry point.
//!
//! Binary name: `weft`
//!
//! Parses CLI arguments, installs logging, loads the engine configuration,
//! then dispatches to the command handler.

mod cli;
mod config;
mod tools;

use std::process::ExitCode;

use clap::Parser;
use weft_observe::{LogFormat, TracingOptions};

use cli::{Cli, Commands, LogFormatArg};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let format = match cli.log_format {
        LogFormatArg::Text => LogFormat::Text,
        LogFormatArg::Json => LogFormat::Json,
    };
    let options = TracingOptions::from_verbosity(cli.verbose)
        .with_format(format)
        .with_otel(cli.otel);
    weft_observe::init_tracing(&options)?;

    let outcome = dispatch(cli).await;
    weft_observe::shutdown_tracing();
    outcome
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        // Schema output needs no configuration
        Commands::Schema => {
            cli::schema::handle_schema()?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => {
            let engine_config = config::load_engine_config(cli.config.as_deref()).await?;
            let result = cli::run::handle_run(args, engine_config, cli.json).await?;
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Validate { file, workflows } => {
            let engine_config = config::load_engine_config(cli.config.as_deref()).await?;
            cli::validate::handle_validate(&file, workflows.as_deref(), engine_config, cli.json)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
