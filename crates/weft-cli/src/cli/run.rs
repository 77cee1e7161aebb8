//! `weft run`: execute a workflow file against the built-in tools.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use weft_core::workflow::definition::load_workflow_file;
use weft_core::workflow::trace::{NoopSink, TraceSink};
use weft_core::workflow::{InMemoryWorkflowRegistry, WorkflowEngine};
use weft_types::config::EngineConfig;
use weft_types::graph::WorkflowGraph;
use weft_types::result::ExecutionResult;

use super::render;
use crate::tools::CliToolCatalog;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to a `.json`, `.yaml` or `.yml` workflow file.
    pub file: PathBuf,

    /// Run input as a JSON document (the starter block's output).
    #[arg(long)]
    pub input: Option<String>,

    /// Execution id to use instead of a generated UUID v7.
    #[arg(long)]
    pub execution_id: Option<String>,

    /// Directory of workflows available to sub-workflow blocks.
    #[arg(long)]
    pub workflows: Option<PathBuf>,

    /// Whole-run timeout in seconds (overrides the config file).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print trace events as they happen.
    #[arg(long)]
    pub stream: bool,
}

/// Handle `weft run`. Returns the finished run so the caller can pick the
/// exit code.
pub async fn handle_run(args: RunArgs, mut config: EngineConfig, json: bool) -> Result<ExecutionResult> {
    if let Some(secs) = args.timeout {
        config.run_timeout_secs = secs;
    }

    let graph = load_workflow_file(&args.file)
        .with_context(|| format!("Failed to load workflow {}", args.file.display()))?;
    let input = parse_input(args.input.as_deref())?;
    let engine = build_engine(&graph, args.workflows.as_deref(), config)?;

    engine
        .validate(&graph)
        .with_context(|| format!("Workflow '{}' is not runnable", graph.id))?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_ctrl_c.cancel();
        }
    });

    let result = if args.stream {
        let (mut events, handle) = engine.run_streaming(graph, input, args.execution_id, cancel);
        while let Some(event) = events.next().await {
            if json {
                println!("{}", serde_json::to_string(&event)?);
            } else {
                println!("{}", render::event_line(&event));
            }
        }
        handle.await.context("Workflow run task failed")?
    } else {
        let sink: Arc<dyn TraceSink> = Arc::new(NoopSink);
        engine
            .run_with(graph, input, args.execution_id, sink, cancel)
            .await
    };

    if json {
        if !args.stream {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    } else {
        render::print_result(&result)?;
    }
    Ok(result)
}

/// Engine over the built-in tools, with sub-workflows loaded from
/// `workflows_dir` plus the workflow being run.
pub fn build_engine(
    graph: &WorkflowGraph,
    workflows_dir: Option<&Path>,
    config: EngineConfig,
) -> Result<WorkflowEngine> {
    let registry = match workflows_dir {
        Some(dir) => InMemoryWorkflowRegistry::from_dir(dir)
            .with_context(|| format!("Failed to load workflows from {}", dir.display()))?,
        None => InMemoryWorkflowRegistry::new(),
    };
    registry.insert(graph.clone());
    tracing::debug!(workflows = registry.len(), "workflow registry loaded");

    let catalog = CliToolCatalog::new(Duration::from_secs(config.block_timeout_secs))?;
    Ok(WorkflowEngine::new(catalog, Arc::new(registry), config))
}

fn parse_input(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    serde_json::from_str(raw).context("--input is not valid JSON")
}
