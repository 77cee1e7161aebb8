//! Workflow engine core: definitions, planning, and execution.
//!
//! - `definition` -- JSON/YAML parsing, binding checks, filesystem load/save
//! - `dag` -- structural validation and per-scope edge indices
//! - `reference` -- `<block.path>` token scanning and resolution
//! - `expression` -- JEXL evaluator for conditions and function blocks
//! - `context` -- layered output stores, scope frames, call stack
//! - `block_runner` -- leaf block dispatch (starter, tool, function, router)
//! - `scheduler` -- ready-set execution of one scope
//! - `loop_controller` / `parallel` -- container controllers
//! - `subflow` -- nested sub-workflow runs
//! - `registry` -- sub-workflow lookup
//! - `trace` -- trace sinks and the per-run tracer
//! - `executor` -- `WorkflowEngine`, the entry point

pub mod block_runner;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
mod loop_controller;
mod parallel;
pub mod reference;
pub mod registry;
mod scheduler;
mod subflow;
pub mod trace;

pub use executor::{TraceStream, WorkflowEngine};
pub use registry::{InMemoryWorkflowRegistry, WorkflowRegistry};


#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use serde_json::Value;
    use weft_types::graph::WorkflowGraph;

    use super::context::ExecutionContext;
    use super::dag::ExecutionPlan;

    pub fn graph(raw: Value) -> WorkflowGraph {
        serde_json::from_value(raw).unwrap()
    }

    pub fn context_for(graph: WorkflowGraph, input: Value) -> ExecutionContext {
        let plan = ExecutionPlan::build(&graph).unwrap();
        ExecutionContext::new("exec-test", Arc::new(plan), input, Vec::new())
    }
}
