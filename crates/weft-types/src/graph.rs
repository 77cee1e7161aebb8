//! Workflow graph types for Weft.
//!
//! `WorkflowGraph` is the serialized, editor-produced shape of a workflow:
//! blocks keyed by id, ordered connections between block handles, and the
//! loop/parallel container specs that group member blocks. The graph is
//! immutable for the duration of a run.

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A complete workflow definition as produced by the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowGraph {
    /// Workflow id. Also the identity used by the sub-workflow call stack.
    pub id: String,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Blocks keyed by id.
    pub blocks: BTreeMap<String, Block>,
    /// Ordered connections between block handles.
    #[serde(default)]
    pub connections: Vec<Edge>,
    /// Loop containers keyed by container block id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub loops: BTreeMap<String, LoopSpec>,
    /// Parallel containers keyed by container block id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parallels: BTreeMap<String, ParallelSpec>,
    /// Workflow-level variables, readable through `<variable.name>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
}

impl WorkflowGraph {
    /// Look up a block by id.
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// Display name of the workflow, falling back to its id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

/// A single node of the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    /// Display name. Its normalized form (lowercase, whitespace removed) is
    /// also a reference identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Disabled blocks are skipped and their outgoing edges never traversed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Enclosing container, if any. Must agree with the container spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Type tag plus the per-type parameters.
    #[serde(flatten)]
    pub config: BlockConfig,
}

fn default_enabled() -> bool {
    true
}

impl Block {
    pub fn block_type(&self) -> BlockType {
        self.config.block_type()
    }

    /// Name used for result keys and log fields.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Per-type block parameters. Closed set, validated at load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BlockConfig {
    /// Entry point; its output is the run input.
    Starter {},
    /// Invoke a catalog tool with resolved parameters.
    Tool {
        tool: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
    /// Evaluate an expression in value mode.
    Function { code: String },
    /// Ordered branches; the first truthy branch wins.
    Router { branches: Vec<Branch> },
    /// Same semantics as `router`, kept as a distinct type for the editor.
    Condition { branches: Vec<Branch> },
    /// Loop container; iteration policy lives in `WorkflowGraph::loops`.
    Loop {},
    /// Parallel container; fan-out policy lives in `WorkflowGraph::parallels`.
    Parallel {},
    /// Run another registered workflow with a resolved input.
    SubWorkflow {
        workflow_id: String,
        #[serde(default)]
        input: Value,
    },
}

impl BlockConfig {
    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Starter {} => BlockType::Starter,
            Self::Tool { .. } => BlockType::Tool,
            Self::Function { .. } => BlockType::Function,
            Self::Router { .. } => BlockType::Router,
            Self::Condition { .. } => BlockType::Condition,
            Self::Loop {} => BlockType::Loop,
            Self::Parallel {} => BlockType::Parallel,
            Self::SubWorkflow { .. } => BlockType::SubWorkflow,
        }
    }

    /// Branches of a router or condition block.
    pub fn branches(&self) -> Option<&[Branch]> {
        match self {
            Self::Router { branches } | Self::Condition { branches } => Some(branches),
            _ => None,
        }
    }
}

/// Discriminant of `BlockConfig`, carried on results and trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Starter,
    Tool,
    Function,
    Router,
    Condition,
    Loop,
    Parallel,
    SubWorkflow,
}

impl BlockType {
    /// Loop and parallel blocks own a member sub-graph.
    pub fn is_container(self) -> bool {
        matches!(self, Self::Loop | Self::Parallel)
    }

    /// Blocks whose cost and tokens count toward run totals directly.
    pub fn is_leaf(self) -> bool {
        !self.is_container()
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starter => "starter",
            Self::Tool => "tool",
            Self::Function => "function",
            Self::Router => "router",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::SubWorkflow => "sub_workflow",
        };
        write!(f, "{s}")
    }
}

/// One branch of a router/condition block.
///
/// A branch without an expression is the `else` branch. It must be the last
/// branch and there must be exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Branch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl Branch {
    pub fn is_else(&self) -> bool {
        self.expression.is_none()
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// A directed connection between two block handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: String,
    #[serde(default)]
    #[schemars(with = "String")]
    pub source_handle: SourceHandle,
    pub target: String,
    /// Carried verbatim; the engine does not interpret it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

/// Which output slot of the source block an edge leaves from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceHandle {
    /// Normal output (`source`). The container end slots
    /// (`loop-end-source`, `parallel-end-source`) are the container's
    /// normal output and map here too.
    #[default]
    Output,
    /// Error output (`error`), followed only when the source fails.
    Error,
    /// A router/condition branch (`condition-<branchId>`).
    Branch(String),
    /// Container start slot (`loop-start-source`, `parallel-start-source`).
    ContainerStart,
}

const BRANCH_PREFIX: &str = "condition-";

impl TryFrom<String> for SourceHandle {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        match value.as_str() {
            "" | "source" | "loop-end-source" | "parallel-end-source" => Ok(Self::Output),
            "error" => Ok(Self::Error),
            "loop-start-source" | "parallel-start-source" | "start-source" => {
                Ok(Self::ContainerStart)
            }
            other => match other.strip_prefix(BRANCH_PREFIX) {
                Some(id) if !id.is_empty() => Ok(Self::Branch(id.to_string())),
                _ => Err(format!("unknown source handle '{other}'")),
            },
        }
    }
}

impl From<SourceHandle> for String {
    fn from(handle: SourceHandle) -> Self {
        handle.to_string()
    }
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Output => write!(f, "source"),
            Self::Error => write!(f, "error"),
            Self::Branch(id) => write!(f, "{BRANCH_PREFIX}{id}"),
            Self::ContainerStart => write!(f, "start-source"),
        }
    }
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// Loop container: member blocks plus the iteration policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoopSpec {
    /// Direct member block ids.
    pub nodes: Vec<String>,
    #[serde(flatten)]
    pub kind: LoopKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "loopType", rename_all = "camelCase")]
pub enum LoopKind {
    /// Fixed iteration count.
    For { iterations: u32 },
    /// Iterate a resolved array, or the `[key, value]` entries of an object.
    ForEach { collection: Value },
    /// Condition checked before each iteration.
    While { condition: String },
    /// Condition checked after each iteration.
    DoWhile { condition: String },
}

impl LoopKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::For { .. } => "for",
            Self::ForEach { .. } => "forEach",
            Self::While { .. } => "while",
            Self::DoWhile { .. } => "doWhile",
        }
    }
}

/// Parallel container: member blocks plus the fan-out policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParallelSpec {
    pub nodes: Vec<String>,
    #[serde(flatten)]
    pub distribution: ParallelDistribution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "parallelType", rename_all = "camelCase")]
pub enum ParallelDistribution {
    /// A fixed number of identical branches.
    Count { count: u32 },
    /// One branch per element of a resolved collection.
    Collection { collection: Value },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
