//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between JSON/YAML files and `WorkflowGraph`, validates the
//! graph by building its `ExecutionPlan`, and discovers workflow files on
//! disk for the sub-workflow registry.

use std::path::{Path, PathBuf};

use thiserror::Error;
use weft_types::error::{BlockError, ErrorKind};
use weft_types::graph::{BlockConfig, WorkflowGraph};

use super::dag::ExecutionPlan;
use super::registry::WorkflowRegistry;
use crate::catalog::BoxToolCatalog;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating a workflow.
///
/// Every variant is a load-time `StructuralError` from the engine's point of
/// view: the run never starts.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// JSON/YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("structural error: {0}")]
    StructuralError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The graph contains a cycle outside a loop body back edge.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// A tool block names a tool the catalog does not provide.
    #[error("block '{block_id}' uses unknown tool '{tool}'")]
    UnknownTool { block_id: String, tool: String },

    /// A sub-workflow block names a workflow the registry does not hold.
    #[error("block '{block_id}' calls unknown workflow '{workflow_id}'")]
    UnknownWorkflow {
        block_id: String,
        workflow_id: String,
    },
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StructuralError
    }
}

impl From<WorkflowError> for BlockError {
    fn from(err: WorkflowError) -> Self {
        BlockError::new(err.kind(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Serialization format of a definition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Json,
    Yaml,
}

impl DefinitionFormat {
    /// Pick the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

/// Parse a JSON string into a validated `WorkflowGraph`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowGraph, WorkflowError> {
    let graph: WorkflowGraph =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    ExecutionPlan::build(&graph)?;
    Ok(graph)
}

/// Parse a YAML string into a validated `WorkflowGraph`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowGraph, WorkflowError> {
    let graph: WorkflowGraph =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    ExecutionPlan::build(&graph)?;
    Ok(graph)
}

pub fn parse_workflow(content: &str, format: DefinitionFormat) -> Result<WorkflowGraph, WorkflowError> {
    match format {
        DefinitionFormat::Json => parse_workflow_json(content),
        DefinitionFormat::Yaml => parse_workflow_yaml(content),
    }
}

pub fn serialize_workflow(
    graph: &WorkflowGraph,
    format: DefinitionFormat,
) -> Result<String, WorkflowError> {
    match format {
        DefinitionFormat::Json => serde_json::to_string_pretty(graph)
            .map_err(|e| WorkflowError::ParseError(e.to_string())),
        DefinitionFormat::Yaml => {
            serde_yaml_ng::to_string(graph).map_err(|e| WorkflowError::ParseError(e.to_string()))
        }
    }
}

/// JSON Schema describing the workflow definition format.
pub fn workflow_schema() -> serde_json::Value {
    schemars::schema_for!(WorkflowGraph).to_value()
}

// ---------------------------------------------------------------------------
// Binding checks
// ---------------------------------------------------------------------------

/// Check that every tool and sub-workflow the graph names is available.
///
/// Runs after structural validation, once the engine's catalog and registry
/// are known.
pub fn check_bindings(
    graph: &WorkflowGraph,
    catalog: &BoxToolCatalog,
    registry: &dyn WorkflowRegistry,
) -> Result<(), WorkflowError> {
    for block in graph.blocks.values() {
        match &block.config {
            BlockConfig::Tool { tool, .. } if !catalog.contains(tool) => {
                return Err(WorkflowError::UnknownTool {
                    block_id: block.id.clone(),
                    tool: tool.clone(),
                });
            }
            BlockConfig::SubWorkflow { workflow_id, .. }
                if workflow_id != &graph.id && !registry.contains(workflow_id) =>
            {
                return Err(WorkflowError::UnknownWorkflow {
                    block_id: block.id.clone(),
                    workflow_id: workflow_id.clone(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow from a `.json`, `.yaml`, or `.yml` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowGraph, WorkflowError> {
    let format = DefinitionFormat::from_path(path).ok_or_else(|| {
        WorkflowError::ParseError(format!(
            "unsupported workflow file extension: {}",
            path.display()
        ))
    })?;
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content, format)
}

/// Save a workflow, picking the format from the file extension.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, graph: &WorkflowGraph) -> Result<(), WorkflowError> {
    let format = DefinitionFormat::from_path(path).unwrap_or(DefinitionFormat::Json);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serialize_workflow(graph, format)?)?;
    Ok(())
}

/// Discover all workflow files under `base_dir`.
///
/// Scans for `.json`, `.yaml`, and `.yml` files recursively. Files that fail
/// to parse or validate are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowGraph)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowGraph)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if DefinitionFormat::from_path(&path).is_some() {
            match load_workflow_file(&path) {
                Ok(graph) => results.push((path, graph)),
                Err(error) => {
                    tracing::warn!(?path, %error, "skipping unparseable workflow file");
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{StaticToolCatalog, ToolResponse};
    use crate::workflow::registry::InMemoryWorkflowRegistry;
    use serde_json::json;

    #[test]
    fn test_workflow_schema_describes_blocks() {
        let schema = workflow_schema();
        assert_eq!(schema["title"], json!("WorkflowGraph"));
        assert!(schema["properties"].get("blocks").is_some());
        assert!(schema["properties"].get("connections").is_some());
    }

    fn minimal_json(id: &str) -> String {
        json!({
            "id": id,
            "blocks": {
                "start": { "id": "start", "type": "starter" },
                "echo": { "id": "echo", "type": "tool", "tool": "echo", "params": { "v": "<start.v>" } }
            },
            "connections": [ { "source": "start", "target": "echo" } ]
        })
        .to_string()
    }

    const MINIMAL_YAML: &str = r#"
id: wf-yaml
blocks:
  start:
    id: start
    type: starter
  double:
    id: double
    type: function
    code: "<start.x> * 2"
connections:
  - source: start
    target: double
"#;

    #[test]
    fn test_parse_json() {
        let graph = parse_workflow_json(&minimal_json("wf-json")).unwrap();
        assert_eq!(graph.id, "wf-json");
        assert_eq!(graph.blocks.len(), 2);
    }

    #[test]
    fn test_parse_yaml() {
        let graph = parse_workflow_yaml(MINIMAL_YAML).unwrap();
        assert_eq!(graph.id, "wf-yaml");
        assert!(matches!(
            graph.block("double").unwrap().config,
            BlockConfig::Function { .. }
        ));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let err = parse_workflow_json("{ not json").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[test]
    fn test_parse_runs_structural_validation() {
        let raw = json!({
            "id": "wf",
            "blocks": { "a": { "id": "a", "type": "function", "code": "1" } }
        })
        .to_string();
        let err = parse_workflow_json(&raw).unwrap_err();
        assert!(err.to_string().contains("starter"), "got: {err}");
    }

    #[test]
    fn test_yaml_roundtrip() {
        let graph = parse_workflow_yaml(MINIMAL_YAML).unwrap();
        let yaml = serialize_workflow(&graph, DefinitionFormat::Yaml).unwrap();
        let back = parse_workflow_yaml(&yaml).unwrap();
        assert_eq!(graph, back);
    }

    #[test]
    fn test_check_bindings() {
        let graph = parse_workflow_json(&minimal_json("wf")).unwrap();
        let registry = InMemoryWorkflowRegistry::new();

        let empty = BoxToolCatalog::new(StaticToolCatalog::new());
        let err = check_bindings(&graph, &empty, &registry).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownTool { ref tool, .. } if tool == "echo"));

        let catalog = BoxToolCatalog::new(
            StaticToolCatalog::new().with_tool("echo", |p| ToolResponse::ok(json!(p))),
        );
        assert!(check_bindings(&graph, &catalog, &registry).is_ok());
    }

    #[test]
    fn test_check_bindings_unknown_workflow() {
        let raw = json!({
            "id": "parent",
            "blocks": {
                "start": { "id": "start", "type": "starter" },
                "call": { "id": "call", "type": "sub_workflow", "workflowId": "child" }
            },
            "connections": [ { "source": "start", "target": "call" } ]
        })
        .to_string();
        let graph = parse_workflow_json(&raw).unwrap();
        let catalog = BoxToolCatalog::new(StaticToolCatalog::new());
        let registry = InMemoryWorkflowRegistry::new();
        let err = check_bindings(&graph, &catalog, &registry).unwrap_err();
        assert!(err.to_string().contains("child"), "got: {err}");

        registry.insert(parse_workflow_json(&minimal_json("child")).unwrap());
        assert!(check_bindings(&graph, &catalog, &registry).is_ok());
    }

    #[test]
    fn test_save_and_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows/test.yaml");

        let graph = parse_workflow_yaml(MINIMAL_YAML).unwrap();
        save_workflow_file(&path, &graph).expect("should save");

        let loaded = load_workflow_file(&path).expect("should load");
        assert_eq!(loaded, graph);
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.txt");
        std::fs::write(&path, minimal_json("wf")).unwrap();
        assert!(matches!(
            load_workflow_file(&path),
            Err(WorkflowError::ParseError(_))
        ));
    }

    #[test]
    fn test_discover_workflows() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.json"), minimal_json("wf-one")).unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/two.yml"), MINIMAL_YAML).unwrap();
        std::fs::write(dir.path().join("not-a-workflow.yaml"), "key: value").unwrap();
        std::fs::write(dir.path().join("notes.md"), "# notes").unwrap();

        let found = discover_workflows(dir.path()).expect("should discover");
        assert_eq!(found.len(), 2, "should find exactly 2 valid workflows");
        let ids: Vec<&str> = found.iter().map(|(_, g)| g.id.as_str()).collect();
        assert!(ids.contains(&"wf-one"));
        assert!(ids.contains(&"wf-yaml"));
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let result = discover_workflows(Path::new("/nonexistent/path"));
        assert!(result.unwrap().is_empty());
    }
}
