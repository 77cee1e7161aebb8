//! Execution plan: structural validation and per-scope edge indices.
//!
//! `ExecutionPlan::build` checks every structural invariant of a
//! `WorkflowGraph` once, before any block runs, and precomputes what the
//! scheduler needs per scope (the top level, and each container body):
//! members, entry blocks, incoming/outgoing edge indices, and sinks.
//!
//! Uses `petgraph` to detect cycles. The only cycles allowed are loop body
//! back edges, which are indexed separately and never scheduled.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use weft_types::graph::{
    Block, BlockConfig, BlockType, Edge, LoopKind, LoopSpec, ParallelDistribution, ParallelSpec,
    SourceHandle, WorkflowGraph,
};

use super::definition::WorkflowError;
use super::reference::{self, LOOP_ROOT, PARALLEL_ROOT, RESERVED_ROOTS, normalize_name};

/// Edge and membership index for one scope.
#[derive(Debug, Clone, Default)]
pub struct ScopeIndex {
    /// Owning container, `None` for the top level.
    pub container: Option<String>,
    /// Direct member block ids, sorted.
    pub members: Vec<String>,
    /// Blocks that become ready when the scope starts.
    pub entries: Vec<String>,
    /// Scheduled edge indices by target.
    pub incoming: HashMap<String, Vec<usize>>,
    /// Scheduled edge indices by source.
    pub outgoing: HashMap<String, Vec<usize>>,
    /// Loop body edges returning to an entry block.
    pub back_edges: Vec<usize>,
    /// Members with no scheduled outgoing edges.
    pub sinks: Vec<String>,
}

impl ScopeIndex {
    pub fn incoming(&self, block_id: &str) -> &[usize] {
        self.incoming.get(block_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn outgoing(&self, block_id: &str) -> &[usize] {
        self.outgoing.get(block_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A validated graph plus its scheduling indices. Immutable per run.
#[derive(Debug)]
pub struct ExecutionPlan {
    graph: Arc<WorkflowGraph>,
    names: HashMap<String, String>,
    parents: HashMap<String, String>,
    top: ScopeIndex,
    containers: HashMap<String, ScopeIndex>,
}

impl ExecutionPlan {
    /// Validate `graph` and build its plan.
    pub fn build(graph: &WorkflowGraph) -> Result<Self, WorkflowError> {
        Self::from_shared(Arc::new(graph.clone()))
    }

    pub fn from_shared(graph: Arc<WorkflowGraph>) -> Result<Self, WorkflowError> {
        check_blocks(&graph)?;
        let names = index_names(&graph)?;
        let parents = index_parents(&graph)?;
        let scope_edges = classify_edges(&graph, &parents)?;

        let mut containers = HashMap::new();
        let mut top = ScopeIndex::default();
        for scope in scope_edges {
            let index = build_scope(&graph, &parents, &scope)?;
            match &scope.container {
                Some(id) => {
                    containers.insert(id.clone(), index);
                }
                None => top = index,
            }
        }

        let plan = Self {
            graph,
            names,
            parents,
            top,
            containers,
        };
        plan.check_acyclic()?;
        plan.check_reachable()?;
        plan.check_references()?;
        Ok(plan)
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.graph.blocks.get(id)
    }

    pub fn edge(&self, index: usize) -> &Edge {
        &self.graph.connections[index]
    }

    /// Index of `container`'s body, or the top level for `None`.
    pub fn scope(&self, container: Option<&str>) -> &ScopeIndex {
        container
            .and_then(|id| self.containers.get(id))
            .unwrap_or(&self.top)
    }

    pub fn top(&self) -> &ScopeIndex {
        &self.top
    }

    pub fn parent_of(&self, block_id: &str) -> Option<&str> {
        self.parents.get(block_id).map(String::as_str)
    }

    pub fn loop_spec(&self, container_id: &str) -> Option<&LoopSpec> {
        self.graph.loops.get(container_id)
    }

    pub fn parallel_spec(&self, container_id: &str) -> Option<&ParallelSpec> {
        self.graph.parallels.get(container_id)
    }

    /// Resolve a reference identifier to a block id: exact id first, then
    /// normalized display name.
    pub fn resolve_block_id(&self, identifier: &str) -> Option<&str> {
        if let Some((id, _)) = self.graph.blocks.get_key_value(identifier) {
            return Some(id);
        }
        self.names.get(&normalize_name(identifier)).map(String::as_str)
    }

    /// Every block nested under `container_id`, at any depth.
    pub fn descendants(&self, container_id: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut queue = VecDeque::from([container_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for member in &self.scope(Some(&current)).members {
                found.push(member.clone());
                if self.containers.contains_key(member) {
                    queue.push_back(member.clone());
                }
            }
        }
        found
    }

    /// Whether `block_id` has an outgoing error edge in its scope.
    pub fn has_error_edge(&self, block_id: &str) -> bool {
        let scope = self.scope(self.parent_of(block_id));
        scope
            .outgoing(block_id)
            .iter()
            .any(|&i| self.edge(i).source_handle == SourceHandle::Error)
    }

    /// Targets of the edges leaving `block_id` through branch `branch_id`.
    pub fn branch_targets(&self, block_id: &str, branch_id: &str) -> Vec<String> {
        let scope = self.scope(self.parent_of(block_id));
        scope
            .outgoing(block_id)
            .iter()
            .map(|&i| self.edge(i))
            .filter(|e| matches!(&e.source_handle, SourceHandle::Branch(b) if b == branch_id))
            .map(|e| e.target.clone())
            .collect()
    }

    fn ancestors(&self, block_id: &str) -> impl Iterator<Item = &str> {
        std::iter::successors(self.parent_of(block_id), |id| self.parent_of(id))
    }

    fn has_ancestor_of_type(&self, block_id: &str, block_type: BlockType) -> bool {
        self.ancestors(block_id)
            .any(|id| self.block(id).is_some_and(|b| b.block_type() == block_type))
    }

    // -----------------------------------------------------------------------
    // Whole-graph checks
    // -----------------------------------------------------------------------

    fn scopes(&self) -> impl Iterator<Item = &ScopeIndex> {
        std::iter::once(&self.top).chain(self.containers.values())
    }

    fn check_acyclic(&self) -> Result<(), WorkflowError> {
        let ids: Vec<&str> = self.graph.blocks.keys().map(String::as_str).collect();
        let position: HashMap<&str, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut dag = DiGraph::<&str, ()>::new();
        let nodes: Vec<_> = ids.iter().map(|id| dag.add_node(*id)).collect();

        let back: HashSet<usize> = self
            .scopes()
            .flat_map(|s| s.back_edges.iter().copied())
            .collect();
        for (i, edge) in self.graph.connections.iter().enumerate() {
            if back.contains(&i) {
                continue;
            }
            let from = nodes[position[edge.source.as_str()]];
            let to = nodes[position[edge.target.as_str()]];
            dag.add_edge(from, to, ());
        }

        toposort(&dag, None).map_err(|cycle| {
            let block_id = dag[cycle.node_id()];
            WorkflowError::CycleDetected(format!("cycle detected involving block '{block_id}'"))
        })?;
        Ok(())
    }

    fn check_reachable(&self) -> Result<(), WorkflowError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = self
            .graph
            .blocks
            .values()
            .filter(|b| b.block_type() == BlockType::Starter)
            .map(|b| b.id.as_str())
            .collect();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for edge in self.graph.connections.iter().filter(|e| e.source == id) {
                queue.push_back(edge.target.as_str());
            }
            if let Some(body) = self.containers.get(id) {
                queue.extend(body.entries.iter().map(String::as_str));
            }
        }

        match self.graph.blocks.keys().find(|id| !seen.contains(id.as_str())) {
            Some(id) => Err(structural(format!(
                "block '{id}' is not reachable from a starter block"
            ))),
            None => Ok(()),
        }
    }

    fn check_references(&self) -> Result<(), WorkflowError> {
        for block in self.graph.blocks.values() {
            let mut texts = Vec::new();
            match &block.config {
                BlockConfig::Tool { params, .. } => {
                    texts.extend(reference::scan_value(&serde_json::Value::Object(params.clone())))
                }
                BlockConfig::Function { code } => texts.extend(reference::scan(code)),
                BlockConfig::Router { branches } | BlockConfig::Condition { branches } => {
                    for expr in branches.iter().filter_map(|b| b.expression.as_deref()) {
                        texts.extend(reference::scan(expr));
                    }
                }
                BlockConfig::SubWorkflow { input, .. } => {
                    texts.extend(reference::scan_value(input))
                }
                BlockConfig::Loop {} => {
                    if let Some(spec) = self.loop_spec(&block.id) {
                        match &spec.kind {
                            LoopKind::ForEach { collection } => {
                                texts.extend(reference::scan_value(collection))
                            }
                            LoopKind::While { condition } | LoopKind::DoWhile { condition } => {
                                texts.extend(reference::scan(condition))
                            }
                            LoopKind::For { .. } => {}
                        }
                    }
                }
                BlockConfig::Parallel {} => {
                    if let Some(ParallelDistribution::Collection { collection }) =
                        self.parallel_spec(&block.id).map(|s| &s.distribution)
                    {
                        texts.extend(reference::scan_value(collection));
                    }
                }
                BlockConfig::Starter {} => {}
            }

            for token in texts {
                self.check_reference(block, &token)?;
            }
        }
        Ok(())
    }

    fn check_reference(
        &self,
        block: &Block,
        token: &reference::Reference,
    ) -> Result<(), WorkflowError> {
        // A container's own spec sees its own frame.
        let in_scope = |kind: BlockType| {
            block.block_type() == kind || self.has_ancestor_of_type(&block.id, kind)
        };
        match token.root.as_str() {
            LOOP_ROOT if !in_scope(BlockType::Loop) => Err(structural(format!(
                "block '{}' uses {} outside of a loop",
                block.id,
                token.raw()
            ))),
            PARALLEL_ROOT if !in_scope(BlockType::Parallel) => Err(structural(format!(
                "block '{}' uses {} outside of a parallel container",
                block.id,
                token.raw()
            ))),
            _ if token.is_reserved() => Ok(()),
            root if self.resolve_block_id(root).is_some() || token.path.is_empty() => Ok(()),
            root => Err(structural(format!(
                "block '{}' references undefined block '{root}' in {}",
                block.id,
                token.raw()
            ))),
        }
    }
}

fn structural(message: impl Into<String>) -> WorkflowError {
    WorkflowError::StructuralError(message.into())
}

// ---------------------------------------------------------------------------
// Block and container checks
// ---------------------------------------------------------------------------

fn is_identifier(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn check_blocks(graph: &WorkflowGraph) -> Result<(), WorkflowError> {
    if graph.id.trim().is_empty() {
        return Err(structural("workflow id must not be empty"));
    }

    let mut starters = 0;
    for (key, block) in &graph.blocks {
        if key != &block.id {
            return Err(structural(format!(
                "block keyed '{key}' declares id '{}'",
                block.id
            )));
        }
        if !is_identifier(&block.id) {
            return Err(structural(format!(
                "block id '{}' may only contain letters, digits, '_' and '-'",
                block.id
            )));
        }
        if RESERVED_ROOTS.contains(&block.id.as_str()) {
            return Err(structural(format!("block id '{}' is reserved", block.id)));
        }

        match &block.config {
            BlockConfig::Starter {} => {
                starters += 1;
                if block.parent_id.is_some() {
                    return Err(structural(format!(
                        "starter block '{}' cannot be inside a container",
                        block.id
                    )));
                }
            }
            BlockConfig::Tool { tool, .. } if tool.trim().is_empty() => {
                return Err(structural(format!("tool block '{}' names no tool", block.id)));
            }
            BlockConfig::Function { code } if code.trim().is_empty() => {
                return Err(structural(format!("function block '{}' has no code", block.id)));
            }
            BlockConfig::Router { branches } | BlockConfig::Condition { branches } => {
                check_branches(&block.id, branches)?;
            }
            BlockConfig::Loop {} if !graph.loops.contains_key(&block.id) => {
                return Err(structural(format!("loop block '{}' has no loop spec", block.id)));
            }
            BlockConfig::Parallel {} if !graph.parallels.contains_key(&block.id) => {
                return Err(structural(format!(
                    "parallel block '{}' has no parallel spec",
                    block.id
                )));
            }
            BlockConfig::SubWorkflow { workflow_id, .. } if workflow_id.trim().is_empty() => {
                return Err(structural(format!(
                    "sub-workflow block '{}' names no workflow",
                    block.id
                )));
            }
            _ => {}
        }
    }

    if starters == 0 {
        return Err(structural("workflow must contain a starter block"));
    }
    Ok(())
}

fn check_branches(block_id: &str, branches: &[weft_types::graph::Branch]) -> Result<(), WorkflowError> {
    let Some(last) = branches.last() else {
        return Err(structural(format!("router block '{block_id}' has no branches")));
    };
    if !last.is_else() {
        return Err(structural(format!(
            "router block '{block_id}' must end with an else branch"
        )));
    }
    if branches.iter().filter(|b| b.is_else()).count() > 1 {
        return Err(structural(format!(
            "router block '{block_id}' has more than one else branch"
        )));
    }
    let mut ids = HashSet::new();
    for branch in branches {
        if !ids.insert(branch.id.as_str()) {
            return Err(structural(format!(
                "router block '{block_id}' has duplicate branch id '{}'",
                branch.id
            )));
        }
        if branch.expression.as_deref().is_some_and(|e| e.trim().is_empty()) {
            return Err(structural(format!(
                "branch '{}' of router block '{block_id}' has an empty expression",
                branch.id
            )));
        }
    }
    Ok(())
}

fn index_names(graph: &WorkflowGraph) -> Result<HashMap<String, String>, WorkflowError> {
    let mut names = HashMap::new();
    for block in graph.blocks.values() {
        let Some(name) = &block.name else { continue };
        let normalized = normalize_name(name);
        if normalized.is_empty() || RESERVED_ROOTS.contains(&normalized.as_str()) {
            continue;
        }
        if let Some(other) = names.insert(normalized.clone(), block.id.clone()) {
            return Err(structural(format!(
                "blocks '{other}' and '{}' share the reference name '{normalized}'",
                block.id
            )));
        }
    }
    Ok(names)
}

fn index_parents(graph: &WorkflowGraph) -> Result<HashMap<String, String>, WorkflowError> {
    let mut parents: HashMap<String, String> = HashMap::new();
    let containers = graph
        .loops
        .iter()
        .map(|(id, spec)| (id, BlockType::Loop, &spec.nodes))
        .chain(
            graph
                .parallels
                .iter()
                .map(|(id, spec)| (id, BlockType::Parallel, &spec.nodes)),
        );

    for (container_id, kind, nodes) in containers {
        match graph.blocks.get(container_id) {
            Some(block) if block.block_type() == kind => {}
            _ => {
                return Err(structural(format!(
                    "{kind} spec '{container_id}' has no matching {kind} block"
                )));
            }
        }
        for node in nodes {
            if !graph.blocks.contains_key(node) {
                return Err(structural(format!(
                    "container '{container_id}' lists unknown block '{node}'"
                )));
            }
            if node == container_id {
                return Err(structural(format!("container '{container_id}' contains itself")));
            }
            if let Some(previous) = parents.insert(node.clone(), container_id.clone()) {
                return Err(structural(format!(
                    "block '{node}' belongs to both '{previous}' and '{container_id}'"
                )));
            }
        }
    }

    for block in graph.blocks.values() {
        if let Some(declared) = &block.parent_id {
            if parents.get(&block.id) != Some(declared) {
                return Err(structural(format!(
                    "block '{}' declares parent '{declared}' but is not listed by that container",
                    block.id
                )));
            }
        }
    }

    // Nesting must be a tree.
    for start in parents.keys() {
        let mut seen = HashSet::from([start.as_str()]);
        let mut current = start.as_str();
        while let Some(parent) = parents.get(current) {
            if !seen.insert(parent.as_str()) {
                return Err(structural(format!(
                    "container nesting cycle involving '{parent}'"
                )));
            }
            current = parent;
        }
    }

    Ok(parents)
}

// ---------------------------------------------------------------------------
// Edge classification
// ---------------------------------------------------------------------------

struct ScopeEdges {
    container: Option<String>,
    edges: Vec<usize>,
    start_edges: Vec<usize>,
}

fn classify_edges(
    graph: &WorkflowGraph,
    parents: &HashMap<String, String>,
) -> Result<Vec<ScopeEdges>, WorkflowError> {
    let mut scopes: BTreeMap<Option<String>, ScopeEdges> = BTreeMap::new();
    scopes.insert(
        None,
        ScopeEdges {
            container: None,
            edges: Vec::new(),
            start_edges: Vec::new(),
        },
    );
    for id in graph.loops.keys().chain(graph.parallels.keys()) {
        scopes.insert(
            Some(id.clone()),
            ScopeEdges {
                container: Some(id.clone()),
                edges: Vec::new(),
                start_edges: Vec::new(),
            },
        );
    }

    for (i, edge) in graph.connections.iter().enumerate() {
        let (Some(source), Some(target)) =
            (graph.blocks.get(&edge.source), graph.blocks.get(&edge.target))
        else {
            return Err(structural(format!(
                "connection {i} ({} -> {}) references an unknown block",
                edge.source, edge.target
            )));
        };
        if target.block_type() == BlockType::Starter {
            return Err(structural(format!(
                "starter block '{}' cannot have incoming connections",
                target.id
            )));
        }

        let source_parent = parents.get(&source.id);
        let target_parent = parents.get(&target.id);

        match &edge.source_handle {
            SourceHandle::ContainerStart => {
                if !source.block_type().is_container() {
                    return Err(structural(format!(
                        "block '{}' has a start handle but is not a container",
                        source.id
                    )));
                }
                if target_parent != Some(&source.id) {
                    return Err(structural(format!(
                        "start connection from '{}' targets '{}', which is not its member",
                        source.id, target.id
                    )));
                }
                if let Some(scope) = scopes.get_mut(&Some(source.id.clone())) {
                    scope.start_edges.push(i);
                }
                continue;
            }
            SourceHandle::Branch(branch_id) => {
                let known = source
                    .config
                    .branches()
                    .is_some_and(|bs| bs.iter().any(|b| &b.id == branch_id));
                if !known {
                    return Err(structural(format!(
                        "connection {i} leaves '{}' through unknown branch '{branch_id}'",
                        source.id
                    )));
                }
            }
            SourceHandle::Output | SourceHandle::Error => {}
        }

        if source_parent != target_parent {
            return Err(structural(format!(
                "connection from '{}' to '{}' crosses a container boundary",
                source.id, target.id
            )));
        }
        if let Some(scope) = scopes.get_mut(&source_parent.cloned()) {
            scope.edges.push(i);
        }
    }

    Ok(scopes.into_values().collect())
}

fn build_scope(
    graph: &WorkflowGraph,
    parents: &HashMap<String, String>,
    scope: &ScopeEdges,
) -> Result<ScopeIndex, WorkflowError> {
    let members: Vec<String> = graph
        .blocks
        .keys()
        .filter(|id| parents.get(*id) == scope.container.as_ref())
        .cloned()
        .collect();

    let starts: Vec<String> = scope
        .start_edges
        .iter()
        .map(|&i| graph.connections[i].target.clone())
        .collect();

    let is_loop = scope
        .container
        .as_ref()
        .is_some_and(|id| graph.loops.contains_key(id));

    let mut index = ScopeIndex {
        container: scope.container.clone(),
        members: members.clone(),
        ..ScopeIndex::default()
    };

    for &i in &scope.edges {
        let edge = &graph.connections[i];
        if is_loop && starts.contains(&edge.target) {
            index.back_edges.push(i);
            continue;
        }
        index.incoming.entry(edge.target.clone()).or_default().push(i);
        index.outgoing.entry(edge.source.clone()).or_default().push(i);
    }

    let mut entries: Vec<String> = Vec::new();
    for id in starts.iter().chain(members.iter()) {
        let is_entry = starts.contains(id) || index.incoming(id).is_empty();
        if is_entry && !entries.contains(id) {
            entries.push(id.clone());
        }
    }
    if let Some(container) = &scope.container {
        if let Some(id) = entries.iter().find(|id| !index.incoming(id).is_empty()) {
            return Err(structural(format!(
                "entry block '{id}' of container '{container}' has incoming connections"
            )));
        }
        if entries.is_empty() && !members.is_empty() {
            return Err(structural(format!("container '{container}' has no entry block")));
        }
    }
    index.entries = entries;

    index.sinks = members
        .iter()
        .filter(|id| index.outgoing(id).is_empty())
        .cloned()
        .collect();

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn plan(raw: Value) -> Result<ExecutionPlan, WorkflowError> {
        let graph: WorkflowGraph = serde_json::from_value(raw).unwrap();
        ExecutionPlan::build(&graph)
    }

    fn err(raw: Value) -> String {
        plan(raw).unwrap_err().to_string()
    }

    fn starter() -> Value {
        json!({ "id": "start", "type": "starter" })
    }

    fn tool(id: &str) -> Value {
        json!({ "id": id, "type": "tool", "tool": "echo" })
    }

    fn member(id: &str, parent: &str) -> Value {
        json!({ "id": id, "type": "tool", "tool": "echo", "parentId": parent })
    }

    fn edge(source: &str, target: &str) -> Value {
        json!({ "source": source, "target": target })
    }

    fn handle_edge(source: &str, handle: &str, target: &str) -> Value {
        json!({ "source": source, "sourceHandle": handle, "target": target })
    }

    #[test]
    fn test_linear_plan() {
        let p = plan(json!({
            "id": "wf",
            "blocks": { "start": starter(), "a": tool("a"), "b": tool("b") },
            "connections": [edge("start", "a"), edge("a", "b")]
        }))
        .unwrap();
        assert_eq!(p.top().entries, vec!["start"]);
        assert_eq!(p.top().sinks, vec!["b"]);
        assert_eq!(p.top().incoming("b").len(), 1);
        assert!(p.top().incoming("start").is_empty());
    }

    #[test]
    fn test_diamond_has_two_incoming() {
        let p = plan(json!({
            "id": "wf",
            "blocks": { "start": starter(), "a": tool("a"), "b": tool("b"), "c": tool("c") },
            "connections": [edge("start", "a"), edge("start", "b"), edge("a", "c"), edge("b", "c")]
        }))
        .unwrap();
        assert_eq!(p.top().incoming("c").len(), 2);
        assert_eq!(p.top().outgoing("start").len(), 2);
    }

    #[test]
    fn test_requires_starter() {
        let msg = err(json!({ "id": "wf", "blocks": { "a": tool("a") } }));
        assert!(msg.contains("starter"), "got: {msg}");
    }

    #[test]
    fn test_rejects_cycle() {
        let msg = err(json!({
            "id": "wf",
            "blocks": { "start": starter(), "a": tool("a"), "b": tool("b") },
            "connections": [edge("start", "a"), edge("a", "b"), edge("b", "a")]
        }));
        assert!(msg.contains("cycle"), "got: {msg}");
    }

    #[test]
    fn test_rejects_unreachable_block() {
        let msg = err(json!({
            "id": "wf",
            "blocks": { "start": starter(), "a": tool("a"), "orphan": tool("orphan") },
            "connections": [edge("start", "a")]
        }));
        assert!(msg.contains("orphan") && msg.contains("not reachable"), "got: {msg}");
    }

    #[test]
    fn test_rejects_unknown_edge_endpoint() {
        let msg = err(json!({
            "id": "wf",
            "blocks": { "start": starter() },
            "connections": [edge("start", "ghost")]
        }));
        assert!(msg.contains("unknown block"), "got: {msg}");
    }

    #[test]
    fn test_rejects_edge_into_starter() {
        let msg = err(json!({
            "id": "wf",
            "blocks": { "start": starter(), "a": tool("a") },
            "connections": [edge("start", "a"), edge("a", "start")]
        }));
        assert!(msg.contains("incoming"), "got: {msg}");
    }

    #[test]
    fn test_router_requires_trailing_else() {
        let msg = err(json!({
            "id": "wf",
            "blocks": {
                "start": starter(),
                "r": { "id": "r", "type": "router", "branches": [
                    { "id": "else" }, { "id": "big", "expression": "1 > 0" }
                ]}
            },
            "connections": [edge("start", "r")]
        }));
        assert!(msg.contains("else"), "got: {msg}");
    }

    #[test]
    fn test_rejects_unknown_branch_handle() {
        let msg = err(json!({
            "id": "wf",
            "blocks": {
                "start": starter(),
                "r": { "id": "r", "type": "router", "branches": [ { "id": "else" } ] },
                "a": tool("a")
            },
            "connections": [edge("start", "r"), handle_edge("r", "condition-nope", "a")]
        }));
        assert!(msg.contains("nope"), "got: {msg}");
    }

    #[test]
    fn test_branch_targets() {
        let p = plan(json!({
            "id": "wf",
            "blocks": {
                "start": starter(),
                "r": { "id": "r", "type": "condition", "branches": [
                    { "id": "yes", "expression": "true" }, { "id": "no" }
                ]},
                "a": tool("a"), "b": tool("b")
            },
            "connections": [
                edge("start", "r"),
                handle_edge("r", "condition-yes", "a"),
                handle_edge("r", "condition-no", "b")
            ]
        }))
        .unwrap();
        assert_eq!(p.branch_targets("r", "yes"), vec!["a"]);
        assert_eq!(p.branch_targets("r", "no"), vec!["b"]);
    }

    fn loop_graph(extra_edges: Vec<Value>) -> Value {
        let mut connections = vec![
            edge("start", "each"),
            handle_edge("each", "loop-start-source", "body"),
            edge("body", "tail"),
            edge("each", "after"),
        ];
        connections.extend(extra_edges);
        json!({
            "id": "wf",
            "blocks": {
                "start": starter(),
                "each": { "id": "each", "type": "loop" },
                "body": member("body", "each"),
                "tail": member("tail", "each"),
                "after": tool("after")
            },
            "connections": connections,
            "loops": { "each": { "nodes": ["body", "tail"], "loopType": "for", "iterations": 2 } }
        })
    }

    #[test]
    fn test_loop_scope_index() {
        let p = plan(loop_graph(vec![])).unwrap();
        let body = p.scope(Some("each"));
        assert_eq!(body.members, vec!["body", "tail"]);
        assert_eq!(body.entries, vec!["body"]);
        assert_eq!(body.sinks, vec!["tail"]);
        assert_eq!(p.parent_of("tail"), Some("each"));
        assert_eq!(p.top().members, vec!["after", "each", "start"]);
        assert_eq!(p.descendants("each"), vec!["body", "tail"]);
    }

    #[test]
    fn test_loop_back_edge_allowed() {
        let p = plan(loop_graph(vec![edge("tail", "body")])).unwrap();
        let body = p.scope(Some("each"));
        assert_eq!(body.back_edges.len(), 1);
        assert_eq!(body.sinks, vec!["tail"]);
    }

    #[test]
    fn test_rejects_boundary_crossing_edge() {
        let msg = err(loop_graph(vec![edge("tail", "after")]));
        assert!(msg.contains("crosses a container boundary"), "got: {msg}");
    }

    #[test]
    fn test_rejects_parent_mismatch() {
        let mut raw = loop_graph(vec![]);
        raw["blocks"]["after"]["parentId"] = json!("each");
        let msg = err(raw);
        assert!(msg.contains("declares parent"), "got: {msg}");
    }

    #[test]
    fn test_rejects_loop_reference_outside_loop() {
        let mut raw = loop_graph(vec![]);
        raw["blocks"]["after"]["params"] = json!({ "i": "<loop.index>" });
        let msg = err(raw);
        assert!(msg.contains("outside of a loop"), "got: {msg}");

        let mut raw = loop_graph(vec![]);
        raw["blocks"]["tail"]["params"] = json!({ "i": "<loop.index>" });
        assert!(plan(raw).is_ok());
    }

    #[test]
    fn test_rejects_undefined_reference() {
        let msg = err(json!({
            "id": "wf",
            "blocks": {
                "start": starter(),
                "a": { "id": "a", "type": "function", "code": "<ghost.value> + 1" }
            },
            "connections": [edge("start", "a")]
        }));
        assert!(msg.contains("undefined block 'ghost'"), "got: {msg}");
    }

    #[test]
    fn test_literal_angle_text_is_not_a_reference() {
        let mut raw = json!({
            "id": "wf",
            "blocks": { "start": starter(), "a": tool("a") },
            "connections": [edge("start", "a")]
        });
        raw["blocks"]["a"]["params"] = json!({ "html": "<div>hi</div>" });
        assert!(plan(raw).is_ok());
    }

    #[test]
    fn test_name_lookup() {
        let p = plan(json!({
            "id": "wf",
            "blocks": {
                "start": starter(),
                "a": { "id": "a", "name": "Summarize Text", "type": "tool", "tool": "echo" }
            },
            "connections": [edge("start", "a")]
        }))
        .unwrap();
        assert_eq!(p.resolve_block_id("summarizetext"), Some("a"));
        assert_eq!(p.resolve_block_id("Summarize Text"), Some("a"));
        assert_eq!(p.resolve_block_id("a"), Some("a"));
        assert_eq!(p.resolve_block_id("nobody"), None);
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let msg = err(json!({
            "id": "wf",
            "blocks": {
                "start": starter(),
                "a": { "id": "a", "name": "Fetch", "type": "tool", "tool": "echo" },
                "b": { "id": "b", "name": "fetch", "type": "tool", "tool": "echo" }
            },
            "connections": [edge("start", "a"), edge("start", "b")]
        }));
        assert!(msg.contains("share the reference name"), "got: {msg}");
    }

    #[test]
    fn test_rejects_reserved_block_id() {
        let msg = err(json!({
            "id": "wf",
            "blocks": { "start": starter(), "loop": tool("loop") },
            "connections": [edge("start", "loop")]
        }));
        assert!(msg.contains("reserved"), "got: {msg}");
    }

    #[test]
    fn test_nested_containers_and_error_edges() {
        let p = plan(json!({
            "id": "wf",
            "blocks": {
                "start": starter(),
                "outer": { "id": "outer", "type": "parallel" },
                "inner": { "id": "inner", "type": "loop", "parentId": "outer" },
                "leaf": member("leaf", "inner"),
                "recover": member("recover", "inner")
            },
            "connections": [
                edge("start", "outer"),
                handle_edge("outer", "parallel-start-source", "inner"),
                handle_edge("inner", "loop-start-source", "leaf"),
                handle_edge("leaf", "error", "recover")
            ],
            "parallels": { "outer": { "nodes": ["inner"], "parallelType": "count", "count": 2 } },
            "loops": { "inner": { "nodes": ["leaf", "recover"], "loopType": "for", "iterations": 2 } }
        }))
        .unwrap();
        assert_eq!(p.descendants("outer"), vec!["inner", "leaf", "recover"]);
        assert!(p.has_error_edge("leaf"));
        assert!(!p.has_error_edge("recover"));
        assert_eq!(p.scope(Some("inner")).entries, vec!["leaf"]);
    }
}
