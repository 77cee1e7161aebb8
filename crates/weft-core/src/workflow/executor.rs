//! Workflow engine: the entry point that owns one execution per call.
//!
//! # Execution flow
//!
//! 1. Validate the graph into an `ExecutionPlan` (structural errors end the
//!    run before any block starts).
//! 2. Create the run state: tracer, leaf permits, cancellation tokens.
//! 3. Run the top-level scope; containers and sub-workflow blocks call back
//!    into the scheduler for their bodies.
//! 4. Finalize: fill in skipped results, pick the final output, derive the
//!    run status, and emit `RunComplete`.

use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weft_types::config::EngineConfig;
use weft_types::error::ErrorKind;
use weft_types::event::TraceEvent;
use weft_types::graph::WorkflowGraph;
use weft_types::result::{BlockResult, ExecutionResult, RunStatus, TokenUsage};

use super::block_runner::BlockRunner;
use super::context::ExecutionContext;
use super::dag::ExecutionPlan;
use super::definition::{WorkflowError, check_bindings};
use super::registry::WorkflowRegistry;
use super::scheduler::{RunShared, ScopeOutcome, run_scope};
use super::trace::{ChannelSink, ExecutionTracer, TraceSink};
use crate::catalog::{BoxToolCatalog, ToolCatalog};
use crate::event::EventBus;

/// Boxed stream of trace events returned by [`WorkflowEngine::run_streaming`].
pub type TraceStream = Pin<Box<dyn Stream<Item = TraceEvent> + Send>>;

/// Engine-wide collaborators shared by every run and nested run.
pub(crate) struct EngineShared {
    pub config: EngineConfig,
    pub runner: BlockRunner,
    pub registry: Arc<dyn WorkflowRegistry>,
}

/// Executes workflow graphs against a tool catalog and a sub-workflow
/// registry. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    shared: Arc<EngineShared>,
    events: EventBus,
}

impl WorkflowEngine {
    pub fn new(
        catalog: impl ToolCatalog + 'static,
        registry: Arc<dyn WorkflowRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self::with_catalog(BoxToolCatalog::new(catalog), registry, config)
    }

    pub fn with_catalog(
        catalog: BoxToolCatalog,
        registry: Arc<dyn WorkflowRegistry>,
        config: EngineConfig,
    ) -> Self {
        let events = EventBus::new(config.trace_capacity.max(1));
        let runner = BlockRunner::new(catalog, config.block_timeout());
        Self {
            shared: Arc::new(EngineShared {
                config,
                runner,
                registry,
            }),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn catalog(&self) -> &BoxToolCatalog {
        self.shared.runner.catalog()
    }

    /// Live trace events of every run started with [`WorkflowEngine::run`].
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Validate structure and check that every named tool and sub-workflow
    /// is available.
    pub fn validate(&self, graph: &WorkflowGraph) -> Result<ExecutionPlan, WorkflowError> {
        let plan = ExecutionPlan::build(graph)?;
        check_bindings(graph, self.catalog(), self.shared.registry.as_ref())?;
        Ok(plan)
    }

    /// Run `graph` with `input`, publishing trace events on the engine's
    /// event bus. A fresh UUID v7 is used when `execution_id` is `None`.
    pub async fn run(
        &self,
        graph: WorkflowGraph,
        input: Value,
        execution_id: Option<String>,
    ) -> ExecutionResult {
        let sink: Arc<dyn TraceSink> = Arc::new(self.events.clone());
        self.run_with(graph, input, execution_id, sink, CancellationToken::new())
            .await
    }

    /// Run `graph`, emitting trace events to `sink`. Cancelling `cancel`
    /// aborts the run; it then finalizes with status `cancelled`.
    pub async fn run_with(
        &self,
        graph: WorkflowGraph,
        input: Value,
        execution_id: Option<String>,
        sink: Arc<dyn TraceSink>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let execution_id = execution_id.unwrap_or_else(|| Uuid::now_v7().to_string());
        let started_at = Utc::now();
        let tracer = ExecutionTracer::new(sink, execution_id.clone(), graph.id.clone());

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %graph.id,
            blocks = graph.blocks.len(),
            "starting workflow run"
        );

        let plan = match ExecutionPlan::from_shared(Arc::new(graph)) {
            Ok(plan) => Arc::new(plan),
            Err(error) => {
                tracing::warn!(execution_id = %execution_id, %error, "workflow failed validation");
                return rejected(&tracer, execution_id, error, started_at);
            }
        };

        let cancel = cancel.child_token();
        let run = Arc::new(RunShared::new(Arc::clone(&self.shared), tracer, cancel.clone()));
        let ctx = ExecutionContext::new(execution_id.as_str(), plan, input, Vec::new());

        let timeout = self.shared.config.run_timeout();
        let execution = execute_run(run, ctx, started_at);
        tokio::pin!(execution);
        tokio::select! {
            result = &mut execution => result,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    execution_id = %execution_id,
                    timeout_secs = timeout.as_secs(),
                    "workflow run timed out, cancelling"
                );
                cancel.cancel();
                execution.await
            }
        }
    }

    /// Start a run on a background task and stream its trace events.
    ///
    /// The stream ends after `RunComplete`; the handle yields the result.
    pub fn run_streaming(
        &self,
        graph: WorkflowGraph,
        input: Value,
        execution_id: Option<String>,
        cancel: CancellationToken,
    ) -> (TraceStream, JoinHandle<ExecutionResult>) {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let sink: Arc<dyn TraceSink> = Arc::new(ChannelSink::new(sender));

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine
                .run_with(graph, input, execution_id, sink, cancel)
                .await
        });

        let stream = async_stream::stream! {
            while let Some(event) = receiver.recv().await {
                yield event;
            }
        };
        (Box::pin(stream), handle)
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Run lifecycle
// ---------------------------------------------------------------------------

/// Run a validated plan to completion. Used for top-level and nested runs.
pub(crate) async fn execute_run(
    run: Arc<RunShared>,
    ctx: ExecutionContext,
    started_at: DateTime<Utc>,
) -> ExecutionResult {
    let outcome = run_scope(Arc::clone(&run), None, ctx.clone()).await;
    finalize(&run, &ctx, outcome, started_at)
}

fn finalize(
    run: &RunShared,
    ctx: &ExecutionContext,
    outcome: ScopeOutcome,
    started_at: DateTime<Utc>,
) -> ExecutionResult {
    let plan = &ctx.plan;
    let ScopeOutcome {
        mut results,
        failure,
        fatal,
    } = outcome;

    for block in plan.graph().blocks.values() {
        if !results.contains_key(&block.id) {
            let skipped = BlockResult::skipped(block.id.clone(), block.block_type());
            run.tracer.on_block_finished(&skipped, None);
            results.insert(block.id.clone(), skipped);
        }
    }

    let output = final_output(plan, &results);

    let (status, failure) = match (fatal, failure) {
        (Some(fatal), _) => (RunStatus::Failed, Some(fatal)),
        (None, _) if run.cancel.is_cancelled() => (RunStatus::Cancelled, None),
        (None, Some(failure)) => (RunStatus::Failed, Some(failure)),
        (None, None) => (RunStatus::Success, None),
    };
    let (error, error_kind) = match (status, failure) {
        (_, Some(failure)) => (Some(failure.to_string()), Some(failure.error.kind)),
        (RunStatus::Cancelled, None) => (
            Some("execution cancelled".to_string()),
            Some(ErrorKind::Cancelled),
        ),
        _ => (None, None),
    };

    let (total_cost, total_tokens) = run.tracer.totals();
    let result = ExecutionResult {
        execution_id: ctx.execution_id.to_string(),
        workflow_id: ctx.workflow_id().to_string(),
        status,
        success: status == RunStatus::Success,
        output,
        error,
        error_kind,
        block_results: results,
        started_at,
        ended_at: Utc::now(),
        total_cost,
        total_tokens,
    };
    run.tracer.on_run_complete(&result);
    result
}

/// The single executed top-level sink's output; several executed sinks give
/// an object keyed by block name; none gives `null`.
fn final_output(
    plan: &ExecutionPlan,
    results: &std::collections::BTreeMap<String, BlockResult>,
) -> Value {
    let executed: Vec<&BlockResult> = plan
        .top()
        .sinks
        .iter()
        .filter_map(|id| results.get(id))
        .filter(|r| r.is_success())
        .collect();

    match executed.as_slice() {
        [] => Value::Null,
        [only] => only.output.clone().unwrap_or(Value::Null),
        many => {
            let mut outputs = Map::new();
            for result in many {
                let name = plan
                    .block(&result.block_id)
                    .map(|b| b.display_name())
                    .unwrap_or(&result.block_id);
                outputs.insert(name.to_string(), result.output.clone().unwrap_or(Value::Null));
            }
            Value::Object(outputs)
        }
    }
}

/// Result of a run whose graph failed validation.
fn rejected(
    tracer: &ExecutionTracer,
    execution_id: String,
    error: WorkflowError,
    started_at: DateTime<Utc>,
) -> ExecutionResult {
    let result = ExecutionResult {
        execution_id,
        workflow_id: tracer.workflow_id().to_string(),
        status: RunStatus::Failed,
        success: false,
        output: Value::Null,
        error: Some(error.to_string()),
        error_kind: Some(error.kind()),
        block_results: Default::default(),
        started_at,
        ended_at: Utc::now(),
        total_cost: 0.0,
        total_tokens: TokenUsage::default(),
    };
    tracer.on_run_complete(&result);
    result
}
