//! Execution result types: per-block results and the final run result.

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BlockError, ErrorKind};
use crate::graph::BlockType;

// ---------------------------------------------------------------------------
// Accounting
// ---------------------------------------------------------------------------

/// Token usage reported by a tool, summed bottom-up across a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt: u64,
    #[serde(default)]
    pub completion: u64,
    #[serde(default)]
    pub total: u64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        self.prompt == 0 && self.completion == 0 && self.total == 0
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt: self.prompt + rhs.prompt,
            completion: self.completion + rhs.completion,
            total: self.total + rhs.total,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

// ---------------------------------------------------------------------------
// Block results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Success,
    Error,
    Skipped,
    Cancelled,
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Structured outcome of one block execution.
///
/// Container members report one aggregated result whose `output` is the
/// per-iteration array and whose `iterations` holds each iteration's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResult {
    pub block_id: String,
    pub block_type: BlockType,
    pub status: BlockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BlockError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iterations: Vec<BlockResult>,
}

impl BlockResult {
    fn blank(block_id: impl Into<String>, block_type: BlockType, status: BlockStatus) -> Self {
        Self {
            block_id: block_id.into(),
            block_type,
            status,
            output: None,
            error: None,
            started_at: None,
            ended_at: None,
            cost: None,
            tokens: None,
            iterations: Vec::new(),
        }
    }

    pub fn success(
        block_id: impl Into<String>,
        block_type: BlockType,
        output: Value,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            output: Some(output),
            started_at: Some(started_at),
            ended_at: Some(Utc::now()),
            ..Self::blank(block_id, block_type, BlockStatus::Success)
        }
    }

    /// A failed block. `Cancelled` errors produce the `cancelled` status.
    pub fn failed(
        block_id: impl Into<String>,
        block_type: BlockType,
        error: BlockError,
        started_at: DateTime<Utc>,
    ) -> Self {
        let status = if error.kind == ErrorKind::Cancelled {
            BlockStatus::Cancelled
        } else {
            BlockStatus::Error
        };
        Self {
            error: Some(error),
            started_at: Some(started_at),
            ended_at: Some(Utc::now()),
            ..Self::blank(block_id, block_type, status)
        }
    }

    pub fn skipped(block_id: impl Into<String>, block_type: BlockType) -> Self {
        Self::blank(block_id, block_type, BlockStatus::Skipped)
    }

    pub fn with_accounting(mut self, cost: Option<f64>, tokens: Option<TokenUsage>) -> Self {
        self.cost = cost;
        self.tokens = tokens;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == BlockStatus::Success
    }

    /// Wall-clock duration in milliseconds, when both timestamps are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Run result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Final result of one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub success: bool,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Kind of the failure that ended the run, when it failed or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub block_results: BTreeMap<String, BlockResult>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_cost: f64,
    pub total_tokens: TokenUsage,
}

impl ExecutionResult {
    pub fn block(&self, block_id: &str) -> Option<&BlockResult> {
        self.block_results.get(block_id)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_usage_sums() {
        let mut total = TokenUsage::default();
        assert!(total.is_zero());
        total += TokenUsage {
            prompt: 10,
            completion: 5,
            total: 15,
        };
        total += TokenUsage {
            prompt: 1,
            completion: 1,
            total: 2,
        };
        assert_eq!(total.total, 17);
        assert_eq!(total.prompt, 11);
    }

    #[test]
    fn test_failed_with_cancelled_kind_is_cancelled_status() {
        let result = BlockResult::failed("a", BlockType::Tool, BlockError::cancelled(), Utc::now());
        assert_eq!(result.status, BlockStatus::Cancelled);

        let result =
            BlockResult::failed("a", BlockType::Tool, BlockError::tool("boom"), Utc::now());
        assert_eq!(result.status, BlockStatus::Error);
    }

    #[test]
    fn test_block_result_serializes_camel_case() {
        let result = BlockResult::success("a", BlockType::Function, json!(6), Utc::now())
            .with_accounting(Some(0.5), None);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["blockId"], "a");
        assert_eq!(json["blockType"], "function");
        assert_eq!(json["status"], "success");
        assert_eq!(json["cost"], 0.5);
        assert!(json.get("tokens").is_none());
        assert!(json.get("iterations").is_none());
        assert!(result.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_skipped_has_no_timestamps() {
        let result = BlockResult::skipped("b", BlockType::Router);
        assert_eq!(result.status, BlockStatus::Skipped);
        assert!(result.duration_ms().is_none());
        assert!(!result.is_success());
    }
}
