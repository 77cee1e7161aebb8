//! Loop containers: `for`, `forEach`, `while` and `doWhile`.
//!
//! Each iteration runs the container's body scope in a child context with
//! its own `loop` frame. Member outputs are appended to per-member
//! accumulators, and once the loop ends the enclosing scope sees each
//! member's output as an array indexed by iteration.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use weft_types::error::BlockError;
use weft_types::graph::{Block, BlockType, LoopKind};
use weft_types::result::{BlockResult, BlockStatus, TokenUsage};

use super::context::{ExecutionContext, FrameKind, OutputStore, ScopeFrame};
use super::dag::ExecutionPlan;
use super::expression::WorkflowEvaluator;
use super::reference;
use super::scheduler::{Completion, RunShared, ScopeOutcome, run_scope};

/// Drive a loop container to completion.
pub(crate) async fn run_loop(
    run: Arc<RunShared>,
    block: Block,
    ctx: ExecutionContext,
    started_at: DateTime<Utc>,
) -> Completion {
    let Some(spec) = ctx.plan.loop_spec(&block.id).cloned() else {
        let error = BlockError::structural(format!("loop block '{}' has no loop spec", block.id));
        return Completion::failed(&block, error, started_at);
    };

    let mut driver = LoopDriver {
        max_iterations: run.engine.config.max_loop_iterations,
        accumulator: Accumulator::new(&ctx.plan, &block.id),
        run,
        block: &block,
        ctx: &ctx,
    };

    tracing::debug!(block_id = %block.id, kind = spec.kind.name(), "loop started");
    let outcome = match &spec.kind {
        LoopKind::For { iterations } => driver.run_for(*iterations as usize).await,
        LoopKind::ForEach { collection } => driver.run_for_each(collection).await,
        LoopKind::While { condition } => driver.run_while(condition, false).await,
        LoopKind::DoWhile { condition } => driver.run_while(condition, true).await,
    };

    driver.accumulator.finish(&block, outcome, started_at)
}

struct LoopDriver<'a> {
    run: Arc<RunShared>,
    block: &'a Block,
    ctx: &'a ExecutionContext,
    max_iterations: usize,
    accumulator: Accumulator,
}

impl LoopDriver<'_> {
    fn frame(&self, index: usize, item: Value, items: Value) -> ScopeFrame {
        ScopeFrame::new(FrameKind::Loop, self.block.id.clone(), index, item, items)
    }

    fn limit_error(&self, requested: usize) -> BlockError {
        BlockError::iteration_limit(format!(
            "loop '{}' requires {requested} iterations, limit is {}",
            self.block.id, self.max_iterations
        ))
    }

    async fn run_for(&mut self, iterations: usize) -> Result<(), BlockError> {
        if iterations > self.max_iterations {
            return Err(self.limit_error(iterations));
        }
        for index in 0..iterations {
            let iteration_ctx = self.ctx.enter(self.frame(index, json!(index), Value::Null));
            self.iterate(index, iteration_ctx).await?;
        }
        Ok(())
    }

    async fn run_for_each(&mut self, collection: &Value) -> Result<(), BlockError> {
        let resolved = reference::resolve_value(collection, self.ctx)?;
        let items = collection_items(resolved, &self.block.id)?;
        if items.len() > self.max_iterations {
            return Err(self.limit_error(items.len()));
        }
        let all = Value::Array(items.clone());
        for (index, item) in items.into_iter().enumerate() {
            let iteration_ctx = self.ctx.enter(self.frame(index, item, all.clone()));
            self.iterate(index, iteration_ctx).await?;
        }
        Ok(())
    }

    /// `while` checks the condition before each iteration, `doWhile` after.
    /// The condition sees the outputs of the previous iteration.
    async fn run_while(&mut self, condition: &str, check_after: bool) -> Result<(), BlockError> {
        let mut previous: Option<Arc<OutputStore>> = None;
        let mut index = 0;
        loop {
            let must_run = check_after && index == 0;
            if !must_run {
                let scope = match &previous {
                    Some(outputs) => self.ctx.with_outputs(Arc::clone(outputs)),
                    None => self.ctx.clone(),
                };
                let probe_index = if check_after { index - 1 } else { index };
                let probe = scope.enter(self.frame(probe_index, json!(probe_index), Value::Null));
                if !WorkflowEvaluator::new().condition_in(condition, &probe)? {
                    return Ok(());
                }
            }
            if index >= self.max_iterations {
                return Err(BlockError::iteration_limit(format!(
                    "loop '{}' still running after {} iterations",
                    self.block.id, self.max_iterations
                )));
            }

            let iteration_ctx = self.ctx.enter(self.frame(index, json!(index), Value::Null));
            previous = Some(Arc::clone(&iteration_ctx.outputs));
            self.iterate(index, iteration_ctx).await?;
            index += 1;
        }
    }

    async fn iterate(&mut self, index: usize, iteration_ctx: ExecutionContext) -> Result<(), BlockError> {
        let outcome = run_scope(
            Arc::clone(&self.run),
            Some(self.block.id.clone()),
            iteration_ctx,
        )
        .await;
        self.accumulator.push(&outcome);

        match outcome.container_error(self.run.abort.is_cancelled()) {
            Some(error) => {
                tracing::debug!(block_id = %self.block.id, index, %error, "loop body failed");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

/// Items of a `forEach` or parallel collection. Objects iterate their
/// entries as `[key, value]` pairs; strings are parsed as JSON.
pub(crate) fn collection_items(value: Value, owner: &str) -> Result<Vec<Value>, BlockError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => Ok(map.into_iter().map(|(k, v)| json!([k, v])).collect()),
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed @ (Value::Array(_) | Value::Object(_))) => collection_items(parsed, owner),
            _ => Err(BlockError::evaluation(format!(
                "collection of '{owner}' is a string that is not a JSON array or object"
            ))),
        },
        Value::Null => Ok(Vec::new()),
        other => Err(BlockError::evaluation(format!(
            "collection of '{owner}' must be an array or object, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Accumulator
// ---------------------------------------------------------------------------

/// Per-member outputs and results across iterations or branches.
pub(crate) struct Accumulator {
    container_id: String,
    direct: Vec<String>,
    members: Vec<(String, BlockType)>,
    runs: BTreeMap<String, Vec<BlockResult>>,
    count: usize,
}

impl Accumulator {
    pub fn new(plan: &ExecutionPlan, container_id: &str) -> Self {
        let members = plan
            .descendants(container_id)
            .into_iter()
            .filter_map(|id| plan.block(&id).map(|b| (id, b.block_type())))
            .collect();
        Self {
            container_id: container_id.to_string(),
            direct: plan.scope(Some(container_id)).members.clone(),
            members,
            runs: BTreeMap::new(),
            count: 0,
        }
    }

    /// Append one iteration. A member with no result contributes a skipped
    /// entry so every accumulator stays index-aligned.
    pub fn push(&mut self, outcome: &ScopeOutcome) {
        for (id, block_type) in &self.members {
            let result = outcome
                .results
                .get(id)
                .cloned()
                .unwrap_or_else(|| BlockResult::skipped(id.clone(), *block_type));
            self.runs.entry(id.clone()).or_default().push(result);
        }
        self.count += 1;
    }

    /// One aggregated result per member: the output is the array of its
    /// per-iteration outputs, cost and tokens are summed.
    fn aggregate(&self) -> Vec<BlockResult> {
        self.members
            .iter()
            .map(|(id, block_type)| {
                let runs = self.runs.get(id).cloned().unwrap_or_default();
                let outputs: Vec<Value> = runs
                    .iter()
                    .map(|r| r.output.clone().unwrap_or(Value::Null))
                    .collect();
                let error = runs.iter().find_map(|r| r.error.clone());
                let status = if error.is_some() {
                    BlockStatus::Error
                } else if !runs.is_empty() && runs.iter().all(|r| r.status == BlockStatus::Skipped) {
                    BlockStatus::Skipped
                } else {
                    BlockStatus::Success
                };
                let (cost, tokens) = sum_accounting(&runs);

                let mut aggregated = BlockResult::skipped(id.clone(), *block_type);
                aggregated.status = status;
                aggregated.output = Some(Value::Array(outputs));
                aggregated.error = error;
                aggregated.started_at = runs.iter().filter_map(|r| r.started_at).min();
                aggregated.ended_at = runs.iter().filter_map(|r| r.ended_at).max();
                aggregated.iterations = runs;
                aggregated.with_accounting(cost, tokens)
            })
            .collect()
    }

    /// Build the container's completion from the accumulated iterations.
    pub fn finish(
        self,
        block: &Block,
        outcome: Result<(), BlockError>,
        started_at: DateTime<Utc>,
    ) -> Completion {
        let members = self.aggregate();
        let direct: Vec<&BlockResult> = members
            .iter()
            .filter(|m| self.direct.contains(&m.block_id))
            .collect();
        let (cost, tokens) = sum_accounting(direct.into_iter());

        let result = match outcome {
            Ok(()) => {
                let mut results = Map::new();
                for member in &members {
                    results.insert(
                        member.block_id.clone(),
                        member.output.clone().unwrap_or(Value::Null),
                    );
                }
                tracing::debug!(block_id = %self.container_id, iterations = self.count, "container finished");
                BlockResult::success(
                    block.id.clone(),
                    block.block_type(),
                    json!({ "iterations": self.count, "results": results }),
                    started_at,
                )
            }
            Err(error) => BlockResult::failed(block.id.clone(), block.block_type(), error, started_at),
        };

        Completion::new(result.with_accounting(cost, tokens)).with_members(members)
    }
}

fn sum_accounting<'a>(results: impl IntoIterator<Item = &'a BlockResult>) -> (Option<f64>, Option<TokenUsage>) {
    let mut cost = None;
    let mut tokens = None;
    for result in results {
        if let Some(c) = result.cost {
            *cost.get_or_insert(0.0) += c;
        }
        if let Some(t) = result.tokens {
            *tokens.get_or_insert_with(TokenUsage::default) += t;
        }
    }
    (cost, tokens)
}
