//! JEXL expression evaluator for router branches, conditional loops, and
//! function blocks.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms.
//! Block references in an expression are lifted out by
//! [`reference::bind_expression`] and bound into the context as `refs`.
//!
//! **Security note:** referenced values are always passed as context
//! objects, NEVER interpolated into expression strings.

use serde_json::{Map, Number, Value, json};
use weft_types::error::BlockError;

use super::context::ExecutionContext;
use super::reference::{self, REFS_BINDING};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {message}")]
    EvalFailed { expression: String, message: String },

    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error(transparent)]
    Unresolved(#[from] reference::ResolveError),
}

impl From<ExpressionError> for BlockError {
    fn from(err: ExpressionError) -> Self {
        match err {
            ExpressionError::Unresolved(inner) => inner.into(),
            other => BlockError::evaluation(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEvaluator
// ---------------------------------------------------------------------------

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(Value::as_str).unwrap_or("")
}

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Construct one per evaluation; it is cheap and never held across awaits.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| Ok(json!(str_arg(args, 0).to_lowercase())))
            .with_transform("upper", |args: &[Value]| Ok(json!(str_arg(args, 0).to_uppercase())))
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(Value::as_str).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        items.contains(&args.get(1).cloned().unwrap_or(Value::Null))
                    }
                    _ => str_arg(args, 0).contains(str_arg(args, 1)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len))
            })
            .with_transform("json", |args: &[Value]| {
                let parsed = serde_json::from_str::<Value>(str_arg(args, 0)).unwrap_or(Value::Null);
                Ok(parsed)
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    ///
    /// The `context` must be a JSON object. Integral floats are normalized
    /// to integers.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map(normalize_numbers)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }

    /// Evaluate an expression to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context).map(|v| truthy(&v))
    }

    /// Resolve the references in `expression` against `ctx`, then evaluate.
    pub fn evaluate_in(&self, expression: &str, ctx: &ExecutionContext) -> Result<Value, ExpressionError> {
        let bound = reference::bind_expression(expression, ctx)?;
        let mut context = Map::new();
        context.insert(REFS_BINDING.to_string(), Value::Array(bound.refs));
        self.evaluate_value(&bound.expression, &Value::Object(context))
    }

    /// Boolean form of [`evaluate_in`](Self::evaluate_in).
    pub fn condition_in(&self, expression: &str, ctx: &ExecutionContext) -> Result<bool, ExpressionError> {
        self.evaluate_in(expression, ctx).map(|v| truthy(&v))
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Turn integral floats (JEXL arithmetic yields `6.0` for `2 * 3`) into
/// JSON integers, recursively.
pub fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 => {
                Value::Number(Number::from(f as i64))
            }
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_numbers(v)))
                .collect(),
        ),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
