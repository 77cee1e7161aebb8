//! Tool invoker boundary.
//!
//! The engine never performs side effects itself: tool blocks hand their
//! resolved parameters to a [`ToolCatalog`]. Catalogs use RPITIT, so the
//! engine stores them behind [`BoxToolCatalog`] for dynamic dispatch.

pub mod box_catalog;
pub mod static_catalog;

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use weft_types::result::TokenUsage;

pub use box_catalog::{BoxToolCatalog, ToolCatalogDyn};
pub use static_catalog::StaticToolCatalog;

/// What a tool invocation reports back.
///
/// `success == false` is a tool-level failure (the call happened and the tool
/// said no). Transport problems are reported as [`ToolError`] instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
}

impl ToolResponse {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            cost: None,
            tokens: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            cost: None,
            tokens: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_tokens(mut self, tokens: TokenUsage) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

/// Errors raised by a catalog while trying to invoke a tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid parameters for tool '{tool}': {message}")]
    InvalidParams { tool: String, message: String },

    #[error("tool invocation failed: {0}")]
    Invocation(String),
}

/// Registry of invokable tools.
pub trait ToolCatalog: Send + Sync {
    /// Whether `tool_id` can be invoked. Checked when a graph is validated.
    fn contains(&self, tool_id: &str) -> bool;

    /// Invoke `tool_id` with fully resolved parameters.
    fn invoke(
        &self,
        tool_id: &str,
        params: &Map<String, Value>,
    ) -> impl Future<Output = Result<ToolResponse, ToolError>> + Send;
}
