//! Engine configuration.
//!
//! `EngineConfig` is the `config.toml` that bounds a run: concurrency,
//! iteration and fan-out ceilings, recursion depth, timeouts, and the output
//! size guard. Every field has a default, so an empty file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits and timeouts applied to every run of an engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Leaf blocks allowed to execute at once across a run and its nested runs.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Ceiling for `for` counts, `forEach` collections, and `while` iterations.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,

    /// Ceiling for parallel branch counts.
    #[serde(default = "default_max_parallel_branches")]
    pub max_parallel_branches: usize,

    /// Maximum sub-workflow nesting depth.
    #[serde(default = "default_max_sub_workflow_depth")]
    pub max_sub_workflow_depth: usize,

    /// Per tool invocation timeout.
    #[serde(default = "default_block_timeout_secs")]
    pub block_timeout_secs: u64,

    /// Whole-run timeout. The run is cancelled when it elapses.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Outputs whose JSON encoding exceeds this are replaced by a marker.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Capacity of the broadcast trace channel.
    #[serde(default = "default_trace_capacity")]
    pub trace_capacity: usize,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_loop_iterations() -> usize {
    1000
}

fn default_max_parallel_branches() -> usize {
    100
}

fn default_max_sub_workflow_depth() -> usize {
    5
}

fn default_block_timeout_secs() -> u64 {
    300
}

fn default_run_timeout_secs() -> u64 {
    1800
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_trace_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_loop_iterations: default_max_loop_iterations(),
            max_parallel_branches: default_max_parallel_branches(),
            max_sub_workflow_depth: default_max_sub_workflow_depth(),
            block_timeout_secs: default_block_timeout_secs(),
            run_timeout_secs: default_run_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            trace_capacity: default_trace_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}
