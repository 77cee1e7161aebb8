//! Reference tokens: `<identifier.path.to.value>`.
//!
//! A token's identifier names a block (by id or normalized name), the
//! nearest enclosing `loop` / `parallel` frame, or the `variable`
//! namespace. Path segments walk objects by key and arrays by index.
//!
//! Two resolution modes:
//! - plain: tokens are replaced by values (a lone token keeps its JSON type,
//!   mixed text is rendered and concatenated);
//! - expression: tokens are rewritten to `refs[i]` and the values are bound
//!   into the evaluation context, never spliced into the expression text.

use serde_json::{Map, Value};
use thiserror::Error;
use weft_types::error::BlockError;

use super::context::{ExecutionContext, FrameKind};

pub const LOOP_ROOT: &str = "loop";
pub const PARALLEL_ROOT: &str = "parallel";
pub const VARIABLE_ROOT: &str = "variable";

/// Identifiers that never name a block.
pub const RESERVED_ROOTS: [&str; 3] = [LOOP_ROOT, PARALLEL_ROOT, VARIABLE_ROOT];

/// Name of the context array that expression-mode references bind into.
pub const REFS_BINDING: &str = "refs";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("reference {reference} names unknown block '{root}'")]
    UnknownBlock { reference: String, root: String },

    #[error("reference {reference}: block '{block_id}' has no output available")]
    NotAvailable { reference: String, block_id: String },

    #[error("reference {reference}: path '{path}' does not exist")]
    MissingPath { reference: String, path: String },

    #[error("reference {reference} used outside of a {scope} container")]
    NoScope {
        reference: String,
        scope: &'static str,
    },
}

impl From<ResolveError> for BlockError {
    fn from(err: ResolveError) -> Self {
        BlockError::unresolved(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// One `<root.path>` token found in a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Byte range of the token, brackets included.
    pub start: usize,
    pub end: usize,
    pub root: String,
    pub path: Vec<String>,
}

impl Reference {
    /// The token as written, brackets included.
    pub fn raw(&self) -> String {
        if self.path.is_empty() {
            format!("<{}>", self.root)
        } else {
            format!("<{}.{}>", self.root, self.path.join("."))
        }
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_ROOTS.contains(&self.root.as_str())
    }
}

/// Normalize a block name into a reference identifier: lowercase, whitespace
/// removed.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Parse the text between `<` and `>`. Roots may contain inner spaces so
/// display names can be referenced as written.
fn parse_inner(inner: &str) -> Option<(String, Vec<String>)> {
    let mut segments = inner.split('.');
    let root = segments.next()?;
    if root.is_empty()
        || root.starts_with(' ')
        || root.ends_with(' ')
        || !root.chars().all(|c| is_segment_char(c) || c == ' ')
    {
        return None;
    }
    let mut path = Vec::new();
    for segment in segments {
        if segment.is_empty() || !segment.chars().all(is_segment_char) {
            return None;
        }
        path.push(segment.to_string());
    }
    Some((root.to_string(), path))
}

/// Find every syntactically valid token in `text`, in order.
///
/// Comparison operators are left alone: in `<a.x> < 3 && <b.y> > 1` only
/// the two references are tokens.
pub fn scan(text: &str) -> Vec<Reference> {
    let mut found = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let rest = &text[i + 1..];
        match rest.find(['<', '>']) {
            Some(offset) if rest.as_bytes()[offset] == b'>' => {
                let end = i + 1 + offset + 1;
                if let Some((root, path)) = parse_inner(&rest[..offset]) {
                    found.push(Reference {
                        start: i,
                        end,
                        root,
                        path,
                    });
                    i = end;
                } else {
                    i += 1;
                }
            }
            Some(offset) => i = i + 1 + offset,
            None => break,
        }
    }
    found
}

/// Collect the tokens of every string nested in `value`.
pub fn scan_value(value: &Value) -> Vec<Reference> {
    let mut found = Vec::new();
    collect(value, &mut found);
    found
}

fn collect(value: &Value, found: &mut Vec<Reference>) {
    match value {
        Value::String(s) => found.extend(scan(s)),
        Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect(v, found)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Look up the value a single token refers to.
///
/// Returns `Ok(None)` for literal text (an unknown identifier with no path,
/// such as `<div>`).
pub fn lookup(reference: &Reference, ctx: &ExecutionContext) -> Result<Option<Value>, ResolveError> {
    let frame_kind = match reference.root.as_str() {
        LOOP_ROOT => Some(FrameKind::Loop),
        PARALLEL_ROOT => Some(FrameKind::Parallel),
        _ => None,
    };
    if let Some(kind) = frame_kind {
        let frame = ctx.nearest_frame(kind).ok_or_else(|| ResolveError::NoScope {
            reference: reference.raw(),
            scope: kind.name(),
        })?;
        return walk(&frame.to_value(), &reference.path, reference).map(Some);
    }

    if reference.root == VARIABLE_ROOT {
        let variables: Map<String, Value> = ctx
            .plan
            .graph()
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        return walk(&Value::Object(variables), &reference.path, reference).map(Some);
    }

    let Some(block_id) = ctx.plan.resolve_block_id(&reference.root) else {
        if reference.path.is_empty() {
            return Ok(None);
        }
        return Err(ResolveError::UnknownBlock {
            reference: reference.raw(),
            root: reference.root.clone(),
        });
    };

    let output = ctx
        .outputs
        .get(block_id)
        .ok_or_else(|| ResolveError::NotAvailable {
            reference: reference.raw(),
            block_id: block_id.to_string(),
        })?;

    // `<block.output...>` addresses the block output itself unless the
    // output carries its own `output` field.
    let path = match reference.path.split_first() {
        Some((first, rest)) if first == "output" && output.get("output").is_none() => rest,
        _ => reference.path.as_slice(),
    };
    walk(&output, path, reference).map(Some)
}

fn walk(value: &Value, path: &[String], reference: &Reference) -> Result<Value, ResolveError> {
    let mut current = value;
    for (depth, segment) in path.iter().enumerate() {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| ResolveError::MissingPath {
            reference: reference.raw(),
            path: path[..=depth].join("."),
        })?;
    }
    Ok(current.clone())
}

/// Plain-mode resolution of a whole JSON value.
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Result<Value, ResolveError> {
    match value {
        Value::String(s) => resolve_str(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_map(map, ctx).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Plain-mode resolution of a parameter map.
pub fn resolve_map(
    map: &Map<String, Value>,
    ctx: &ExecutionContext,
) -> Result<Map<String, Value>, ResolveError> {
    map.iter()
        .map(|(k, v)| resolve_value(v, ctx).map(|v| (k.clone(), v)))
        .collect()
}

/// Plain-mode resolution of one string.
pub fn resolve_str(text: &str, ctx: &ExecutionContext) -> Result<Value, ResolveError> {
    let references = scan(text);
    if references.is_empty() {
        return Ok(Value::String(text.to_string()));
    }

    // A string that is exactly one token keeps the referenced JSON type.
    if let [only] = references.as_slice() {
        if only.start == 0 && only.end == text.len() {
            return Ok(lookup(only, ctx)?.unwrap_or_else(|| Value::String(text.to_string())));
        }
    }

    let mut rendered = String::with_capacity(text.len());
    let mut cursor = 0;
    for reference in &references {
        rendered.push_str(&text[cursor..reference.start]);
        match lookup(reference, ctx)? {
            Some(value) => rendered.push_str(&value_to_string(&value)),
            None => rendered.push_str(&text[reference.start..reference.end]),
        }
        cursor = reference.end;
    }
    rendered.push_str(&text[cursor..]);
    Ok(Value::String(rendered))
}

/// An expression with its references lifted out into bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundExpression {
    /// Expression text with each reference replaced by `refs[i]`.
    pub expression: String,
    /// Values for `refs`, in order.
    pub refs: Vec<Value>,
}

/// Expression-mode resolution.
pub fn bind_expression(text: &str, ctx: &ExecutionContext) -> Result<BoundExpression, ResolveError> {
    let mut expression = String::with_capacity(text.len());
    let mut refs = Vec::new();
    let mut cursor = 0;
    for reference in scan(text) {
        expression.push_str(&text[cursor..reference.start]);
        match lookup(&reference, ctx)? {
            Some(value) => {
                expression.push_str(&format!("{REFS_BINDING}[{}]", refs.len()));
                refs.push(value);
            }
            None => expression.push_str(&text[reference.start..reference.end]),
        }
        cursor = reference.end;
    }
    expression.push_str(&text[cursor..]);
    Ok(BoundExpression { expression, refs })
}

/// Render a JSON value as text for string interpolation.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
