//! Sub-workflow registry.
//!
//! Sub-workflow blocks name their target by workflow id. The engine looks the
//! id up in a [`WorkflowRegistry`] passed at construction.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use weft_types::graph::WorkflowGraph;

use super::definition::{WorkflowError, discover_workflows};

/// Source of workflow graphs for sub-workflow blocks.
pub trait WorkflowRegistry: Send + Sync {
    fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowGraph>>;

    fn contains(&self, workflow_id: &str) -> bool {
        self.get(workflow_id).is_some()
    }
}

/// Registry backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRegistry {
    graphs: DashMap<String, Arc<WorkflowGraph>>,
}

impl InMemoryWorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `graph` under its id, replacing any previous graph.
    pub fn insert(&self, graph: WorkflowGraph) -> Option<Arc<WorkflowGraph>> {
        self.graphs.insert(graph.id.clone(), Arc::new(graph))
    }

    /// Registry holding every workflow found under `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, WorkflowError> {
        let registry = Self::new();
        for (path, graph) in discover_workflows(dir)? {
            tracing::debug!(?path, workflow_id = %graph.id, "registered workflow");
            if let Some(previous) = registry.insert(graph) {
                tracing::warn!(?path, workflow_id = %previous.id, "duplicate workflow id, later file wins");
            }
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

impl WorkflowRegistry for InMemoryWorkflowRegistry {
    fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowGraph>> {
        self.graphs.get(workflow_id).map(|g| Arc::clone(&g))
    }
}
