//! Execution context: the outputs visible to a scope, its loop/parallel
//! frames, and the sub-workflow call stack.
//!
//! One context exists per run, per nested sub-workflow run, per loop
//! iteration, and per parallel branch. Child contexts layer an own
//! [`OutputStore`] over a read-only parent, so sibling branches never see
//! each other's outputs.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};

use super::dag::ExecutionPlan;

// ---------------------------------------------------------------------------
// Output store
// ---------------------------------------------------------------------------

/// Append-once map of block id to output, layered over a parent store.
#[derive(Debug, Default)]
pub struct OutputStore {
    entries: DashMap<String, Value>,
    parent: Option<Arc<OutputStore>>,
}

impl OutputStore {
    pub fn root() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn child(parent: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            parent: Some(Arc::clone(parent)),
        })
    }

    /// Record an output. Returns `false` (and keeps the first value) if the
    /// block already has an output in this layer.
    pub fn record(&self, block_id: &str, output: Value) -> bool {
        match self.entries.entry(block_id.to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!(block_id, "output already recorded in this scope, ignoring");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(output);
                true
            }
        }
    }

    /// Look up an output in this layer, then in the parents.
    pub fn get(&self, block_id: &str) -> Option<Value> {
        match self.entries.get(block_id) {
            Some(value) => Some(value.clone()),
            None => self.parent.as_ref().and_then(|p| p.get(block_id)),
        }
    }

    /// Look up an output recorded in this layer only.
    pub fn get_local(&self, block_id: &str) -> Option<Value> {
        self.entries.get(block_id).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Replace an output whose JSON encoding exceeds `max_bytes` with a marker.
pub fn bounded_output(block_id: &str, output: Value, max_bytes: usize) -> Value {
    let size = match serde_json::to_vec(&output) {
        Ok(bytes) => bytes.len(),
        Err(_) => return output,
    };
    if size <= max_bytes {
        return output;
    }
    tracing::warn!(
        block_id,
        size,
        max = max_bytes,
        "block output exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_original_size": size,
        "_message": format!("output exceeded {max_bytes} byte limit and was truncated"),
    })
}

// ---------------------------------------------------------------------------
// Scope frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Loop,
    Parallel,
}

impl FrameKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Loop => "loop",
            Self::Parallel => "parallel",
        }
    }
}

/// `{index, item, items}` binding of one container iteration or branch.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeFrame {
    pub kind: FrameKind,
    pub container_id: String,
    pub index: usize,
    pub item: Value,
    pub items: Value,
}

impl ScopeFrame {
    pub fn new(
        kind: FrameKind,
        container_id: impl Into<String>,
        index: usize,
        item: Value,
        items: Value,
    ) -> Self {
        Self {
            kind,
            container_id: container_id.into(),
            index,
            item,
            items,
        }
    }

    /// The frame as seen by references (`<loop.index>` etc).
    pub fn to_value(&self) -> Value {
        json!({
            "index": self.index,
            "item": self.item,
            "items": self.items,
        })
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Everything a block needs to resolve its inputs.
///
/// Cheap to clone: all fields are shared.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Arc<str>,
    pub plan: Arc<ExecutionPlan>,
    pub outputs: Arc<OutputStore>,
    pub frames: Arc<Vec<ScopeFrame>>,
    /// Workflow ids currently executing, outermost first.
    pub call_stack: Arc<Vec<String>>,
    pub input: Arc<Value>,
}

impl ExecutionContext {
    /// Context for a run of `plan`. The workflow id is pushed onto `call_stack`.
    pub fn new(
        execution_id: impl Into<Arc<str>>,
        plan: Arc<ExecutionPlan>,
        input: Value,
        mut call_stack: Vec<String>,
    ) -> Self {
        call_stack.push(plan.graph().id.clone());
        Self {
            execution_id: execution_id.into(),
            plan,
            outputs: OutputStore::root(),
            frames: Arc::new(Vec::new()),
            call_stack: Arc::new(call_stack),
            input: Arc::new(input),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.plan.graph().id
    }

    /// Child context for one container iteration or branch.
    pub fn enter(&self, frame: ScopeFrame) -> Self {
        let mut frames = Vec::with_capacity(self.frames.len() + 1);
        frames.extend(self.frames.iter().cloned());
        frames.push(frame);
        Self {
            outputs: OutputStore::child(&self.outputs),
            frames: Arc::new(frames),
            ..self.clone()
        }
    }

    /// Same frames, but reading outputs through `outputs`.
    pub fn with_outputs(&self, outputs: Arc<OutputStore>) -> Self {
        Self {
            outputs,
            ..self.clone()
        }
    }

    /// Nearest enclosing frame of the given kind.
    pub fn nearest_frame(&self, kind: FrameKind) -> Option<&ScopeFrame> {
        self.frames.iter().rev().find(|f| f.kind == kind)
    }

    /// Innermost frame index, used to tag trace events.
    pub fn iteration(&self) -> Option<usize> {
        self.frames.last().map(|f| f.index)
    }

    pub fn depth(&self) -> usize {
        self.call_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_is_append_once() {
        let store = OutputStore::root();
        assert!(store.record("a", json!(1)));
        assert!(!store.record("a", json!(2)));
        assert_eq!(store.get("a"), Some(json!(1)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_child_store_layers_over_parent() {
        let parent = OutputStore::root();
        parent.record("a", json!("parent"));

        let left = OutputStore::child(&parent);
        let right = OutputStore::child(&parent);
        left.record("b", json!("left"));

        assert_eq!(left.get("a"), Some(json!("parent")));
        assert_eq!(left.get("b"), Some(json!("left")));
        assert_eq!(right.get("b"), None, "siblings are isolated");
        assert_eq!(parent.get("b"), None, "children never write up");
        assert_eq!(left.get_local("a"), None);

        assert!(left.record("a", json!("shadow")));
        assert_eq!(left.get("a"), Some(json!("shadow")));
    }

    #[test]
    fn test_bounded_output_truncates_large_values() {
        let large = json!("x".repeat(200));
        let output = bounded_output("big", large, 100);
        assert_eq!(output["_truncated"], json!(true));
        assert!(output["_original_size"].as_u64().unwrap() > 200);

        let small = bounded_output("small", json!({"ok": true}), 100);
        assert_eq!(small, json!({"ok": true}));
    }

    #[test]
    fn test_frame_value_shape() {
        let frame = ScopeFrame::new(FrameKind::Parallel, "p", 2, json!("c"), json!(["a", "b", "c"]));
        assert_eq!(
            frame.to_value(),
            json!({"index": 2, "item": "c", "items": ["a", "b", "c"]})
        );
        assert_eq!(frame.kind.name(), "parallel");
    }
}
