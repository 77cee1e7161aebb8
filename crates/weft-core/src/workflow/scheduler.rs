//! Scope scheduler: ready-set execution of one scope's sub-graph.
//!
//! A scope is the top level of a run, or one iteration/branch of a loop or
//! parallel container. [`run_scope`] tracks the state of every scheduled
//! edge in the scope. A block becomes ready once none of its incoming edges
//! is pending and at least one is active; a block whose incoming edges are
//! all pruned is skipped, and pruning propagates downstream. Ready blocks
//! run concurrently as tasks in a `JoinSet`. Only leaf blocks take a permit
//! from the run's semaphore, so containers waiting on their bodies never
//! starve the pool.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinSet};
use tokio_util::sync::CancellationToken;
use weft_types::error::{BlockError, ErrorKind};
use weft_types::graph::{Block, BlockConfig, BlockType, SourceHandle};
use weft_types::result::BlockResult;

use super::context::{ExecutionContext, bounded_output};
use super::executor::EngineShared;
use super::trace::ExecutionTracer;
use super::{loop_controller, parallel, subflow};

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// State shared by every scope of one run.
pub(crate) struct RunShared {
    pub engine: Arc<EngineShared>,
    pub tracer: ExecutionTracer,
    /// Leaf block permits, shared with nested runs.
    pub permits: Arc<Semaphore>,
    /// Caller abort or run timeout.
    pub cancel: CancellationToken,
    /// Fires on `cancel` and on a fatal error in this run.
    pub abort: CancellationToken,
}

impl RunShared {
    pub fn new(engine: Arc<EngineShared>, tracer: ExecutionTracer, cancel: CancellationToken) -> Self {
        let permits = Arc::new(Semaphore::new(engine.config.max_concurrency.max(1)));
        Self {
            engine,
            tracer,
            permits,
            abort: cancel.child_token(),
            cancel,
        }
    }

    /// State for a nested run of `workflow_id`. Aborting this run cancels
    /// the nested one; a fatal error in the nested run stays inside it until
    /// the sub-workflow block reports it.
    pub fn nested(&self, workflow_id: &str) -> Self {
        let cancel = self.abort.child_token();
        Self {
            engine: Arc::clone(&self.engine),
            tracer: self.tracer.nested(workflow_id),
            permits: Arc::clone(&self.permits),
            abort: cancel.child_token(),
            cancel,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What a block task hands back to its scope.
#[derive(Debug)]
pub(crate) struct Completion {
    pub result: BlockResult,
    /// Branch chosen by a router or condition block.
    pub selected_branch: Option<String>,
    /// Aggregated results of a container's members across iterations.
    pub members: Vec<BlockResult>,
}

impl Completion {
    pub fn new(result: BlockResult) -> Self {
        Self {
            result,
            selected_branch: None,
            members: Vec::new(),
        }
    }

    pub fn failed(block: &Block, error: BlockError, started_at: DateTime<Utc>) -> Self {
        Self::new(BlockResult::failed(
            block.id.clone(),
            block.block_type(),
            error,
            started_at,
        ))
    }

    pub fn with_members(mut self, members: Vec<BlockResult>) -> Self {
        self.members = members;
        self
    }
}

/// A block failure together with the block that raised it.
#[derive(Debug, Clone)]
pub(crate) struct BlockFailure {
    pub block_id: String,
    pub error: BlockError,
}

impl fmt::Display for BlockFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block '{}' failed: {}", self.block_id, self.error)
    }
}

/// Result of running one scope to completion.
#[derive(Debug, Default)]
pub(crate) struct ScopeOutcome {
    pub results: BTreeMap<String, BlockResult>,
    /// First failure that was not routed along an error edge.
    pub failure: Option<BlockFailure>,
    /// First fatal error; the run was aborted when it was recorded.
    pub fatal: Option<BlockFailure>,
}

impl ScopeOutcome {
    /// Error a container reports for this body run, if any.
    pub fn container_error(&self, cancelled: bool) -> Option<BlockError> {
        if let Some(fatal) = &self.fatal {
            return Some(BlockError::new(fatal.error.kind, fatal.to_string()));
        }
        if cancelled {
            return Some(BlockError::cancelled());
        }
        self.failure
            .as_ref()
            .map(|failure| BlockError::new(failure.error.kind, failure.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Scope driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Pending,
    Active,
    /// Branch not taken, or source disabled. A target with another active
    /// edge still runs.
    Pruned,
    /// Source failed without an error edge. The target never runs.
    Failed,
}

/// Run the body of `container` (or the top level) in `ctx`.
pub(crate) fn run_scope(
    run: Arc<RunShared>,
    container: Option<String>,
    ctx: ExecutionContext,
) -> BoxFuture<'static, ScopeOutcome> {
    async move { ScopeRun::new(run, container, ctx).drive().await }.boxed()
}

struct ScopeRun {
    run: Arc<RunShared>,
    ctx: ExecutionContext,
    container: Option<String>,
    edges: HashMap<usize, EdgeState>,
    pending: HashMap<String, usize>,
    ready: VecDeque<String>,
    tasks: JoinSet<Completion>,
    running: HashMap<TaskId, Block>,
    outcome: ScopeOutcome,
}

impl ScopeRun {
    fn new(run: Arc<RunShared>, container: Option<String>, ctx: ExecutionContext) -> Self {
        let plan = Arc::clone(&ctx.plan);
        let scope = plan.scope(container.as_deref());

        let mut edges = HashMap::new();
        let mut pending = HashMap::new();
        for member in &scope.members {
            let incoming = scope.incoming(member);
            pending.insert(member.clone(), incoming.len());
            edges.extend(incoming.iter().map(|&i| (i, EdgeState::Pending)));
        }

        Self {
            run,
            ctx,
            container,
            edges,
            pending,
            ready: scope.entries.iter().cloned().collect(),
            tasks: JoinSet::new(),
            running: HashMap::new(),
            outcome: ScopeOutcome::default(),
        }
    }

    async fn drive(mut self) -> ScopeOutcome {
        loop {
            while let Some(block_id) = self.ready.pop_front() {
                self.dispatch(&block_id);
            }

            let Some(joined) = self.tasks.join_next_with_id().await else {
                break;
            };
            match joined {
                Ok((task_id, completion)) => {
                    self.running.remove(&task_id);
                    self.complete(completion);
                }
                Err(join_error) => {
                    let Some(block) = self.running.remove(&join_error.id()) else {
                        tracing::error!(error = %join_error, "untracked block task failed");
                        continue;
                    };
                    tracing::error!(block_id = %block.id, error = %join_error, "block task panicked");
                    let error = BlockError::tool(format!("block '{}' panicked during execution", block.id));
                    self.complete(Completion::failed(&block, error, Utc::now()));
                }
            }
        }
        self.outcome
    }

    fn dispatch(&mut self, block_id: &str) {
        let Some(block) = self.ctx.plan.block(block_id).cloned() else {
            return;
        };

        if !block.enabled || self.run.abort.is_cancelled() {
            tracing::debug!(
                block_id,
                disabled = !block.enabled,
                "skipping block"
            );
            self.skip(&block, EdgeState::Pruned);
            return;
        }

        let started_at = Utc::now();
        self.run
            .tracer
            .on_block_start(&block, self.ctx.iteration(), started_at);

        let task = execute_block(
            Arc::clone(&self.run),
            block.clone(),
            self.ctx.clone(),
            started_at,
        );
        let handle = self.tasks.spawn(task);
        self.running.insert(handle.id(), block);
    }

    fn complete(&mut self, completion: Completion) {
        let Completion {
            mut result,
            selected_branch,
            members,
        } = completion;
        let plan = Arc::clone(&self.ctx.plan);
        let scope = plan.scope(self.container.as_deref());
        let block_id = result.block_id.clone();
        let iteration = self.ctx.iteration();

        for member in members {
            if let Some(output) = &member.output {
                self.ctx.outputs.record(&member.block_id, output.clone());
            }
            self.outcome.results.insert(member.block_id.clone(), member);
        }

        let mut settled = Vec::new();
        match result.error.clone() {
            None => {
                let output = bounded_output(
                    &block_id,
                    result.output.take().unwrap_or(Value::Null),
                    self.run.engine.config.max_output_bytes,
                );
                self.ctx.outputs.record(&block_id, output.clone());
                result.output = Some(output);

                for &i in scope.outgoing(&block_id) {
                    let state = match &plan.edge(i).source_handle {
                        SourceHandle::Output | SourceHandle::ContainerStart => EdgeState::Active,
                        SourceHandle::Error => EdgeState::Pruned,
                        SourceHandle::Branch(branch) if selected_branch.as_ref() == Some(branch) => {
                            EdgeState::Active
                        }
                        SourceHandle::Branch(_) => EdgeState::Pruned,
                    };
                    settled.push((i, state));
                }
            }
            Some(error) if error.is_fatal() => {
                tracing::warn!(block_id = %block_id, %error, "fatal block error, aborting run");
                if self.outcome.fatal.is_none() {
                    self.outcome.fatal = Some(BlockFailure {
                        block_id: block_id.clone(),
                        error,
                    });
                }
                self.run.abort.cancel();
                settled.extend(scope.outgoing(&block_id).iter().map(|&i| (i, EdgeState::Failed)));
            }
            Some(error) if error.kind.is_block_local() && plan.has_error_edge(&block_id) => {
                tracing::debug!(block_id = %block_id, %error, "routing block error along error edge");
                let output = json!({ "error": error.message });
                self.ctx.outputs.record(&block_id, output.clone());
                result.output = Some(output);

                for &i in scope.outgoing(&block_id) {
                    let state = if plan.edge(i).source_handle == SourceHandle::Error {
                        EdgeState::Active
                    } else {
                        EdgeState::Pruned
                    };
                    settled.push((i, state));
                }
            }
            Some(error) => {
                if error.kind != ErrorKind::Cancelled && self.outcome.failure.is_none() {
                    self.outcome.failure = Some(BlockFailure {
                        block_id: block_id.clone(),
                        error,
                    });
                }
                settled.extend(scope.outgoing(&block_id).iter().map(|&i| (i, EdgeState::Failed)));
            }
        }

        self.run.tracer.on_block_finished(&result, iteration);
        self.outcome.results.insert(block_id, result);

        for (edge, state) in settled {
            self.settle(edge, state);
        }
    }

    /// Record `block` as skipped and settle its outgoing edges as `outgoing`.
    fn skip(&mut self, block: &Block, outgoing: EdgeState) {
        let result = BlockResult::skipped(block.id.clone(), block.block_type());
        self.run.tracer.on_block_finished(&result, self.ctx.iteration());
        self.outcome.results.insert(block.id.clone(), result);

        let plan = Arc::clone(&self.ctx.plan);
        let scope = plan.scope(self.container.as_deref());
        for &i in scope.outgoing(&block.id) {
            self.settle(i, outgoing);
        }
    }

    /// Move edge `edge` out of `Pending` and resolve its target once every
    /// incoming edge of the target has settled.
    fn settle(&mut self, edge: usize, state: EdgeState) {
        let previous = self.edges.insert(edge, state);
        if previous != Some(EdgeState::Pending) {
            return;
        }

        let plan = Arc::clone(&self.ctx.plan);
        let target = plan.edge(edge).target.as_str();
        let Some(remaining) = self.pending.get_mut(target) else {
            return;
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return;
        }

        let scope = plan.scope(self.container.as_deref());
        let incoming: Vec<EdgeState> = scope
            .incoming(target)
            .iter()
            .filter_map(|i| self.edges.get(i).copied())
            .collect();
        let Some(block) = plan.block(target) else {
            return;
        };
        if incoming.contains(&EdgeState::Failed) {
            tracing::debug!(block_id = target, "upstream block failed");
            self.skip(block, EdgeState::Failed);
        } else if incoming.contains(&EdgeState::Active) {
            self.ready.push_back(target.to_string());
        } else {
            tracing::debug!(block_id = target, "every incoming edge pruned");
            self.skip(block, EdgeState::Pruned);
        }
    }
}

// ---------------------------------------------------------------------------
// Block dispatch
// ---------------------------------------------------------------------------

/// Execute one block to completion. Containers and sub-workflows drive
/// their own bodies; leaves go through the block runner under a permit.
fn execute_block(
    run: Arc<RunShared>,
    block: Block,
    ctx: ExecutionContext,
    started_at: DateTime<Utc>,
) -> BoxFuture<'static, Completion> {
    async move {
        match block.block_type() {
            BlockType::Loop => loop_controller::run_loop(run, block, ctx, started_at).await,
            BlockType::Parallel => parallel::run_parallel(run, block, ctx, started_at).await,
            BlockType::SubWorkflow => subflow::run_sub_workflow(run, block, ctx, started_at).await,
            _ => run_leaf(run, block, ctx, started_at).await,
        }
    }
    .boxed()
}

async fn run_leaf(
    run: Arc<RunShared>,
    block: Block,
    ctx: ExecutionContext,
    started_at: DateTime<Utc>,
) -> Completion {
    let permit = tokio::select! {
        biased;
        _ = run.abort.cancelled() => None,
        permit = Arc::clone(&run.permits).acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        return Completion::failed(&block, BlockError::cancelled(), started_at);
    };

    let outcome = tokio::select! {
        biased;
        _ = run.abort.cancelled() => Err(BlockError::cancelled()),
        outcome = run.engine.runner.run(&block, &ctx) => outcome,
    };

    match outcome {
        Ok(leaf) => Completion {
            selected_branch: leaf.output.selected_branch().map(str::to_string),
            result: BlockResult::success(
                block.id.clone(),
                block.block_type(),
                leaf.output.to_value(),
                started_at,
            )
            .with_accounting(leaf.cost, leaf.tokens),
            members: Vec::new(),
        },
        Err(error) => {
            if let BlockConfig::Tool { tool, .. } = &block.config {
                tracing::debug!(block_id = %block.id, tool = %tool, %error, "tool block failed");
            }
            Completion::failed(&block, error, started_at)
        }
    }
}
