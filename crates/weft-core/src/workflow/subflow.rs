//! Sub-workflow blocks: run another registered workflow as a nested
//! execution and surface its final output or failure.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use weft_types::error::{BlockError, ErrorKind};
use weft_types::graph::{Block, BlockConfig};
use weft_types::result::{BlockResult, ExecutionResult};

use super::context::ExecutionContext;
use super::dag::ExecutionPlan;
use super::executor::execute_run;
use super::reference;
use super::scheduler::{Completion, RunShared};

pub(crate) async fn run_sub_workflow(
    run: Arc<RunShared>,
    block: Block,
    ctx: ExecutionContext,
    started_at: DateTime<Utc>,
) -> Completion {
    let BlockConfig::SubWorkflow { workflow_id, input } = &block.config else {
        let error = BlockError::structural(format!("block '{}' is not a sub-workflow block", block.id));
        return Completion::failed(&block, error, started_at);
    };

    let nested = match call(&run, workflow_id, input, &ctx).await {
        Ok(nested) => nested,
        Err(error) => return Completion::failed(&block, error, started_at),
    };

    let cost = Some(nested.total_cost);
    let tokens = (!nested.total_tokens.is_zero()).then_some(nested.total_tokens);
    let result = if nested.success {
        BlockResult::success(block.id.clone(), block.block_type(), nested.output, started_at)
    } else {
        let kind = nested.error_kind.unwrap_or(ErrorKind::ToolError);
        let message = format!(
            "sub-workflow '{workflow_id}' {}: {}",
            nested.status,
            nested.error.as_deref().unwrap_or("no error reported")
        );
        BlockResult::failed(block.id.clone(), block.block_type(), BlockError::new(kind, message), started_at)
    };
    Completion::new(result.with_accounting(cost, tokens))
}

async fn call(
    run: &Arc<RunShared>,
    workflow_id: &str,
    input: &Value,
    ctx: &ExecutionContext,
) -> Result<ExecutionResult, BlockError> {
    if ctx.call_stack.iter().any(|id| id == workflow_id) {
        return Err(BlockError::recursion(format!(
            "workflow '{workflow_id}' is already executing (call stack: {})",
            ctx.call_stack.join(" -> ")
        )));
    }
    let max_depth = run.engine.config.max_sub_workflow_depth;
    if ctx.depth() > max_depth {
        return Err(BlockError::recursion(format!(
            "sub-workflow depth limit {max_depth} reached calling '{workflow_id}'"
        )));
    }

    let input = reference::resolve_value(input, ctx)?;
    let graph = run.engine.registry.get(workflow_id).ok_or_else(|| {
        BlockError::structural(format!("sub-workflow '{workflow_id}' is not registered"))
    })?;
    let plan = ExecutionPlan::from_shared(graph)?;

    tracing::debug!(
        execution_id = %ctx.execution_id,
        workflow_id,
        depth = ctx.depth(),
        "starting nested run"
    );
    let nested = Arc::new(run.nested(workflow_id));
    let nested_ctx = ExecutionContext::new(
        Arc::clone(&ctx.execution_id),
        Arc::new(plan),
        input,
        ctx.call_stack.to_vec(),
    );
    Ok(execute_run(nested, nested_ctx, Utc::now()).await)
}
