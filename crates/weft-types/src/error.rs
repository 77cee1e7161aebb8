use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy for block and run failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A `<ref.path>` token did not resolve.
    UnresolvedReference,
    /// The tool invoker reported failure, errored, or timed out.
    ToolError,
    /// A condition or function expression failed to evaluate.
    EvaluationError,
    /// Sub-workflow call cycle or depth limit.
    RecursionDetected,
    /// Loop or parallel bound exceeded.
    IterationLimitExceeded,
    /// Caller abort, run timeout, or sibling fatal error.
    Cancelled,
    /// Malformed graph.
    StructuralError,
}

impl ErrorKind {
    /// Fatal kinds abort the run they occur in and every enclosing run.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::RecursionDetected | Self::IterationLimitExceeded | Self::StructuralError
        )
    }

    /// Block-local kinds may be routed along an error edge.
    pub fn is_block_local(self) -> bool {
        matches!(
            self,
            Self::UnresolvedReference | Self::ToolError | Self::EvaluationError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnresolvedReference => "UnresolvedReference",
            Self::ToolError => "ToolError",
            Self::EvaluationError => "EvaluationError",
            Self::RecursionDetected => "RecursionDetected",
            Self::IterationLimitExceeded => "IterationLimitExceeded",
            Self::Cancelled => "Cancelled",
            Self::StructuralError => "StructuralError",
        };
        write!(f, "{s}")
    }
}

/// A block-level failure: a kind from the taxonomy plus a message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct BlockError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BlockError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unresolved(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnresolvedReference, message)
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolError, message)
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::EvaluationError, message)
    }

    pub fn recursion(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RecursionDetected, message)
    }

    pub fn iteration_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IterationLimitExceeded, message)
    }

    pub fn structural(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StructuralError, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "execution cancelled")
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(ErrorKind::RecursionDetected.is_fatal());
        assert!(ErrorKind::IterationLimitExceeded.is_fatal());
        assert!(ErrorKind::StructuralError.is_fatal());
        assert!(!ErrorKind::ToolError.is_fatal());
        assert!(!ErrorKind::Cancelled.is_fatal());
        assert!(!ErrorKind::Cancelled.is_block_local());
        assert!(ErrorKind::EvaluationError.is_block_local());
    }

    #[test]
    fn test_block_error_display() {
        let err = BlockError::tool("connection refused");
        assert_eq!(err.to_string(), "ToolError: connection refused");
    }

    #[test]
    fn test_block_error_serde() {
        let err = BlockError::unresolved("<a.b> not found");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "UnresolvedReference");
        let back: BlockError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }
}
