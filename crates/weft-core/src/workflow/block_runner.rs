//! Block runner for leaf blocks: starter, tool, function, router, condition.
//!
//! `BlockRunner` dispatches on `BlockConfig`. Each handler resolves its
//! references against the execution context, does its work, and returns a
//! `BlockOutput`. Containers and sub-workflow blocks are driven by their own
//! controllers because they call back into the scheduler.

use std::time::Duration;

use serde_json::{Value, json};
use weft_types::error::BlockError;
use weft_types::graph::{Block, BlockConfig, Branch};
use weft_types::result::TokenUsage;

use super::context::ExecutionContext;
use super::expression::WorkflowEvaluator;
use super::reference;
use crate::catalog::BoxToolCatalog;

// ---------------------------------------------------------------------------
// BlockOutput
// ---------------------------------------------------------------------------

/// Output of a leaf block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutput {
    /// Generic JSON output.
    Value(Value),
    /// Router/condition branch selection.
    Branch {
        branch_id: String,
        /// False only when the `else` branch was taken.
        condition_met: bool,
        /// Blocks directly targeted by the selected branch.
        block_ids: Vec<String>,
    },
}

impl BlockOutput {
    /// Convert the output to the JSON value stored in the context.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::Branch {
                branch_id,
                condition_met,
                block_ids,
            } => json!({
                "selectedPath": {
                    "branchId": branch_id,
                    "blockIds": block_ids,
                },
                "conditionResult": condition_met,
            }),
        }
    }

    pub fn selected_branch(&self) -> Option<&str> {
        match self {
            Self::Branch { branch_id, .. } => Some(branch_id),
            Self::Value(_) => None,
        }
    }
}

/// A leaf block's output plus the accounting its tool reported.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafOutcome {
    pub output: BlockOutput,
    pub cost: Option<f64>,
    pub tokens: Option<TokenUsage>,
}

impl LeafOutcome {
    fn value(output: Value) -> Self {
        Self {
            output: BlockOutput::Value(output),
            cost: None,
            tokens: None,
        }
    }
}

// ---------------------------------------------------------------------------
// BlockRunner
// ---------------------------------------------------------------------------

/// Executes leaf blocks.
#[derive(Debug, Clone)]
pub struct BlockRunner {
    catalog: BoxToolCatalog,
    block_timeout: Duration,
}

impl BlockRunner {
    pub fn new(catalog: BoxToolCatalog, block_timeout: Duration) -> Self {
        Self {
            catalog,
            block_timeout,
        }
    }

    pub fn catalog(&self) -> &BoxToolCatalog {
        &self.catalog
    }

    /// Run a leaf block and return its output.
    pub async fn run(&self, block: &Block, ctx: &ExecutionContext) -> Result<LeafOutcome, BlockError> {
        match &block.config {
            BlockConfig::Starter {} => Ok(LeafOutcome::value((*ctx.input).clone())),
            BlockConfig::Tool { tool, params } => self.run_tool(tool, params, ctx).await,
            BlockConfig::Function { code } => run_function(code, ctx),
            BlockConfig::Router { branches } | BlockConfig::Condition { branches } => {
                run_router(block, branches, ctx)
            }
            BlockConfig::Loop {} | BlockConfig::Parallel {} | BlockConfig::SubWorkflow { .. } => {
                Err(BlockError::structural(format!(
                    "block '{}' of type {} is not a leaf block",
                    block.id,
                    block.block_type()
                )))
            }
        }
    }

    async fn run_tool(
        &self,
        tool: &str,
        params: &serde_json::Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<LeafOutcome, BlockError> {
        let resolved = reference::resolve_map(params, ctx)?;

        let response = tokio::time::timeout(self.block_timeout, self.catalog.invoke(tool, &resolved))
            .await
            .map_err(|_| {
                BlockError::tool(format!(
                    "tool '{tool}' timed out after {}s",
                    self.block_timeout.as_secs()
                ))
            })?
            .map_err(|e| BlockError::tool(e.to_string()))?;

        if !response.success {
            let message = response
                .error
                .unwrap_or_else(|| format!("tool '{tool}' reported failure"));
            return Err(BlockError::tool(message));
        }

        Ok(LeafOutcome {
            output: BlockOutput::Value(response.output.unwrap_or(Value::Null)),
            cost: response.cost,
            tokens: response.tokens,
        })
    }
}

fn run_function(code: &str, ctx: &ExecutionContext) -> Result<LeafOutcome, BlockError> {
    let value = WorkflowEvaluator::new().evaluate_in(code, ctx)?;
    Ok(LeafOutcome::value(value))
}

/// First truthy branch wins; the trailing `else` branch always matches.
fn run_router(block: &Block, branches: &[Branch], ctx: &ExecutionContext) -> Result<LeafOutcome, BlockError> {
    let evaluator = WorkflowEvaluator::new();
    for branch in branches {
        let selected = match &branch.expression {
            None => true,
            Some(expression) => evaluator.condition_in(expression, ctx)?,
        };
        if selected {
            return Ok(LeafOutcome {
                output: BlockOutput::Branch {
                    branch_id: branch.id.clone(),
                    condition_met: !branch.is_else(),
                    block_ids: ctx.plan.branch_targets(&block.id, &branch.id),
                },
                cost: None,
                tokens: None,
            });
        }
    }
    Err(BlockError::evaluation(format!(
        "router block '{}' selected no branch",
        block.id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{StaticToolCatalog, ToolResponse};
    use crate::workflow::test_support::{context_for, graph};
    use weft_types::error::ErrorKind;

    fn ctx() -> ExecutionContext {
        let graph = graph(json!({
            "id": "wf",
            "blocks": {
                "start": { "id": "start", "type": "starter" },
                "fetch": { "id": "fetch", "type": "tool", "tool": "echo", "params": { "n": "<start.n>", "label": "n=<start.n>" } },
                "double": { "id": "double", "type": "function", "code": "<start.n> * 2" },
                "route": { "id": "route", "type": "router", "branches": [
                    { "id": "big", "expression": "<start.n> > 10" },
                    { "id": "small", "expression": "<start.n> > 1" },
                    { "id": "other" }
                ]},
                "b": { "id": "b", "type": "tool", "tool": "echo" },
                "c": { "id": "c", "type": "tool", "tool": "echo" },
                "d": { "id": "d", "type": "tool", "tool": "echo" }
            },
            "connections": [
                { "source": "start", "target": "fetch" },
                { "source": "start", "target": "double" },
                { "source": "start", "target": "route" },
                { "source": "route", "sourceHandle": "condition-big", "target": "b" },
                { "source": "route", "sourceHandle": "condition-small", "target": "c" },
                { "source": "route", "sourceHandle": "condition-other", "target": "d" }
            ]
        }));
        let ctx = context_for(graph, json!({"n": 3}));
        ctx.outputs.record("start", json!({"n": 3}));
        ctx
    }

    fn runner(catalog: StaticToolCatalog) -> BlockRunner {
        BlockRunner::new(BoxToolCatalog::new(catalog), Duration::from_secs(5))
    }

    fn echo_catalog() -> StaticToolCatalog {
        StaticToolCatalog::new()
            .with_tool("echo", |params| ToolResponse::ok(json!(params)).with_cost(0.1))
    }

    #[tokio::test]
    async fn test_starter_outputs_input() {
        let ctx = ctx();
        let block = ctx.plan.block("start").unwrap().clone();
        let outcome = runner(echo_catalog()).run(&block, &ctx).await.unwrap();
        assert_eq!(outcome.output.to_value(), json!({"n": 3}));
    }

    #[tokio::test]
    async fn test_tool_receives_resolved_params() {
        let ctx = ctx();
        let block = ctx.plan.block("fetch").unwrap().clone();
        let outcome = runner(echo_catalog()).run(&block, &ctx).await.unwrap();
        assert_eq!(outcome.output.to_value(), json!({"n": 3, "label": "n=3"}));
        assert_eq!(outcome.cost, Some(0.1));
    }

    #[tokio::test]
    async fn test_tool_failure_is_tool_error() {
        let ctx = ctx();
        let block = ctx.plan.block("fetch").unwrap().clone();
        let catalog = StaticToolCatalog::new().with_tool("echo", |_| ToolResponse::failed("quota exceeded"));
        let err = runner(catalog).run(&block, &ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolError);
        assert!(err.message.contains("quota exceeded"), "got: {err}");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_tool_error() {
        let ctx = ctx();
        let block = ctx.plan.block("fetch").unwrap().clone();
        let err = runner(StaticToolCatalog::new()).run(&block, &ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_timeout() {
        let ctx = ctx();
        let block = ctx.plan.block("fetch").unwrap().clone();
        let catalog = StaticToolCatalog::new().with_delayed_tool("echo", Duration::from_secs(60), |_| {
            ToolResponse::ok(json!(1))
        });
        let runner = BlockRunner::new(BoxToolCatalog::new(catalog), Duration::from_secs(1));
        let err = runner.run(&block, &ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolError);
        assert!(err.message.contains("timed out"), "got: {err}");
    }

    #[tokio::test]
    async fn test_function_block() {
        let ctx = ctx();
        let block = ctx.plan.block("double").unwrap().clone();
        let outcome = runner(echo_catalog()).run(&block, &ctx).await.unwrap();
        assert_eq!(outcome.output.to_value(), json!(6));
    }

    #[tokio::test]
    async fn test_router_first_truthy_branch_wins() {
        let ctx = ctx();
        let block = ctx.plan.block("route").unwrap().clone();
        let outcome = runner(echo_catalog()).run(&block, &ctx).await.unwrap();
        assert_eq!(outcome.output.selected_branch(), Some("small"));
        assert_eq!(
            outcome.output.to_value(),
            json!({
                "selectedPath": { "branchId": "small", "blockIds": ["c"] },
                "conditionResult": true
            })
        );
    }

    #[tokio::test]
    async fn test_router_falls_back_to_else() {
        let graph_ctx = ctx();
        let ctx = context_for(graph_ctx.plan.graph().clone(), json!({"n": 0}));
        ctx.outputs.record("start", json!({"n": 0}));
        let block = ctx.plan.block("route").unwrap().clone();
        let outcome = runner(echo_catalog()).run(&block, &ctx).await.unwrap();
        assert_eq!(outcome.output.selected_branch(), Some("other"));
        assert_eq!(outcome.output.to_value()["conditionResult"], json!(false));
    }

    #[tokio::test]
    async fn test_containers_are_not_leaves() {
        let ctx = ctx();
        let block: Block = serde_json::from_value(json!({"id": "l", "type": "loop"})).unwrap();
        let err = runner(echo_catalog()).run(&block, &ctx).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::StructuralError);
    }
}
