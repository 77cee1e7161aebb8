//! Parallel containers: fan the body out over a count or a collection and
//! join once every branch has settled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::{Value, json};
use weft_types::error::BlockError;
use weft_types::graph::{Block, ParallelDistribution};

use super::context::{ExecutionContext, FrameKind, ScopeFrame};
use super::loop_controller::{Accumulator, collection_items};
use super::reference;
use super::scheduler::{Completion, RunShared, run_scope};

/// Drive a parallel container to completion.
///
/// A failing branch never cancels its siblings. After the join the
/// container reports the first fatal error, then cancellation, then the
/// first branch failure in branch-index order.
pub(crate) async fn run_parallel(
    run: Arc<RunShared>,
    block: Block,
    ctx: ExecutionContext,
    started_at: DateTime<Utc>,
) -> Completion {
    let mut accumulator = Accumulator::new(&ctx.plan, &block.id);

    let branches = match branch_frames(&run, &block, &ctx) {
        Ok(frames) => frames,
        Err(error) => return accumulator.finish(&block, Err(error), started_at),
    };
    tracing::debug!(block_id = %block.id, branches = branches.len(), "parallel fan-out");

    // Branch scopes are polled together here; their leaf blocks run as
    // spawned tasks, so slow tools in different branches overlap.
    let outcomes = join_all(branches.into_iter().map(|frame| {
        run_scope(Arc::clone(&run), Some(block.id.clone()), ctx.enter(frame))
    }))
    .await;

    let cancelled = run.abort.is_cancelled();
    let mut fatal = None;
    let mut failure = None;
    for (index, outcome) in outcomes.iter().enumerate() {
        accumulator.push(outcome);
        match outcome.container_error(false) {
            Some(error) if error.is_fatal() => {
                fatal.get_or_insert(error);
            }
            Some(error) => {
                tracing::debug!(block_id = %block.id, index, %error, "parallel branch failed");
                failure.get_or_insert(error);
            }
            None => {}
        }
    }

    let outcome = match (fatal, failure) {
        (Some(error), _) => Err(error),
        (None, _) if cancelled => Err(BlockError::cancelled()),
        (None, Some(error)) => Err(error),
        (None, None) => Ok(()),
    };
    accumulator.finish(&block, outcome, started_at)
}

fn branch_frames(
    run: &RunShared,
    block: &Block,
    ctx: &ExecutionContext,
) -> Result<Vec<ScopeFrame>, BlockError> {
    let Some(spec) = ctx.plan.parallel_spec(&block.id) else {
        return Err(BlockError::structural(format!(
            "parallel block '{}' has no parallel spec",
            block.id
        )));
    };

    let limit = run.engine.config.max_parallel_branches;
    let limit_error = |requested: usize| {
        BlockError::iteration_limit(format!(
            "parallel '{}' requires {requested} branches, limit is {limit}",
            block.id
        ))
    };

    let (items, all): (Vec<Value>, Value) = match &spec.distribution {
        ParallelDistribution::Count { count } => {
            let count = *count as usize;
            if count > limit {
                return Err(limit_error(count));
            }
            ((0..count).map(|i| json!(i)).collect(), Value::Null)
        }
        ParallelDistribution::Collection { collection } => {
            let resolved = reference::resolve_value(collection, ctx)?;
            let items = collection_items(resolved, &block.id)?;
            let all = Value::Array(items.clone());
            (items, all)
        }
    };

    if items.len() > limit {
        return Err(limit_error(items.len()));
    }

    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, item)| ScopeFrame::new(FrameKind::Parallel, block.id.clone(), index, item, all.clone()))
        .collect())
}
