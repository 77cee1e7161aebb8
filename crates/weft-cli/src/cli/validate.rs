//! `weft validate`: structural checks plus tool and sub-workflow bindings.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use weft_core::workflow::definition::load_workflow_file;
use weft_types::config::EngineConfig;

use super::run::build_engine;

/// Validate a workflow file. Returns an error describing the first problem.
pub fn handle_validate(file: &Path, workflows: Option<&Path>, config: EngineConfig, json: bool) -> Result<()> {
    let graph = load_workflow_file(file)
        .with_context(|| format!("Failed to load workflow {}", file.display()))?;
    let engine = build_engine(&graph, workflows, config)?;
    let plan = engine
        .validate(&graph)
        .with_context(|| format!("Workflow '{}' is not runnable", graph.id))?;

    let blocks = graph.blocks.len();
    let containers = graph.loops.len() + graph.parallels.len();
    if json {
        let out = serde_json::json!({
            "valid": true,
            "workflow_id": graph.id,
            "blocks": blocks,
            "containers": containers,
            "entry_blocks": plan.top().entries,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Workflow '{}' is valid",
            style("*").green().bold(),
            style(graph.display_name()).cyan()
        );
        println!("  Blocks: {blocks}");
        println!("  Containers: {containers}");
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_reports_cycles() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("cycle.json");
        std::fs::write(
            &path,
            r#"{
                "id": "cycle",
                "blocks": {
                    "start": { "id": "start", "type": "starter" },
                    "a": { "id": "a", "type": "tool", "tool": "echo" },
                    "b": { "id": "b", "type": "tool", "tool": "echo" }
                },
                "connections": [
                    { "source": "start", "target": "a" },
                    { "source": "a", "target": "b" },
                    { "source": "b", "target": "a" }
                ]
            }"#,
        )
        .unwrap();
        assert!(handle_validate(&path, None, EngineConfig::default(), true).is_err());
    }

    #[test]
    fn test_validate_accepts_echo_workflow() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("ok.yaml");
        std::fs::write(
            &path,
            "id: ok\nblocks:\n  start: { id: start, type: starter }\n  e: { id: e, type: tool, tool: echo }\nconnections:\n  - { source: start, target: e }\n",
        )
        .unwrap();
        handle_validate(&path, None, EngineConfig::default(), true).unwrap();
    }
}
