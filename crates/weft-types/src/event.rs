//! Trace events streamed while a workflow runs.
//!
//! Every event carries the execution id. A run emits `BlockStarted` /
//! `BlockFinished` pairs (skipped blocks emit only `BlockFinished`) and ends
//! with exactly one `RunComplete`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BlockError;
use crate::graph::BlockType;
use crate::result::{BlockStatus, RunStatus, TokenUsage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TraceEvent {
    /// A block began executing.
    BlockStarted {
        execution_id: String,
        /// Workflow the block belongs to (differs from the top-level
        /// workflow for blocks of nested sub-workflow runs).
        workflow_id: String,
        block_id: String,
        block_type: BlockType,
        /// Iteration or branch index when running inside a container.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<usize>,
        started_at: DateTime<Utc>,
    },

    /// A block reached a terminal status.
    BlockFinished {
        execution_id: String,
        workflow_id: String,
        block_id: String,
        block_type: BlockType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<usize>,
        status: BlockStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ended_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<BlockError>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<TokenUsage>,
    },

    /// Terminal event of a top-level run.
    RunComplete {
        execution_id: String,
        workflow_id: String,
        success: bool,
        status: RunStatus,
        total_duration_ms: i64,
        total_cost: f64,
        total_tokens: TokenUsage,
    },
}

impl TraceEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::BlockStarted { execution_id, .. }
            | Self::BlockFinished { execution_id, .. }
            | Self::RunComplete { execution_id, .. } => execution_id,
        }
    }

    pub fn block_id(&self) -> Option<&str> {
        match self {
            Self::BlockStarted { block_id, .. } | Self::BlockFinished { block_id, .. } => {
                Some(block_id)
            }
            Self::RunComplete { .. } => None,
        }
    }

    pub fn is_run_complete(&self) -> bool {
        matches!(self, Self::RunComplete { .. })
    }
}
