//! Workflow Data Model
//!
//! Serializable representation of a block graph as produced by the editor.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: greeting
//! blocks:
//!   - id: start
//!     type: starter
//!     name: Start
//!   - id: reply
//!     type: response
//!     name: Reply
//!     config:
//!       data: "Hello <start.name>"
//!
//! edges:
//!   - source: start
//!     target: reply
//! ```

use std::collections::BTreeSet;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Layout metadata from the editor. Irrelevant to execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single node of the graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Unique identifier within the graph
    pub id: String,

    /// Handler tag (e.g. "starter", "condition", "agent")
    #[serde(rename = "type")]
    pub block_type: String,

    /// Human label, normalized into a reference prefix
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    /// Type-specific parameters; string values may contain references
    #[serde(default = "empty_object", deserialize_with = "object_or_null")]
    pub config: Value,

    /// Disabled blocks are never executed but stay in the graph
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Token bodies (e.g. `agent.content`) that must resolve for this block to run
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_references: BTreeSet<String>,
}

fn default_enabled() -> bool {
    true
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Accepts a JSON object or null for the config field.
fn object_or_null<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(empty_object()),
        Value::Object(_) => Ok(val),
        _ => Err(de::Error::custom("Expected block config to be an object")),
    }
}

impl Block {
    /// Creates a new enabled block with an empty config.
    ///
    /// # Example
    ///
    /// ```
    /// use blockrunner::workflow::Block;
    /// use serde_json::json;
    ///
    /// let block = Block::new("reply", "response")
    ///     .with_name("Reply")
    ///     .with_config(json!({"data": "<start.message>"}));
    /// assert_eq!(block.reference_name(), "Reply");
    /// ```
    pub fn new(id: impl Into<String>, block_type: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            block_type: block_type.into().trim().to_string(),
            name: String::new(),
            position: None,
            config: empty_object(),
            enabled: true,
            required_references: BTreeSet::new(),
        }
    }

    /// Sets the human label.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replaces the config. Non-object values are ignored.
    pub fn with_config(mut self, config: Value) -> Self {
        if config.is_object() {
            self.config = config;
        }
        self
    }

    /// Marks the block disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Declares a reference (without angle brackets) as required.
    pub fn requires(mut self, reference: impl Into<String>) -> Self {
        self.required_references.insert(reference.into());
        self
    }

    /// Name used for references: the label, falling back to the id.
    pub fn reference_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A directed dependency between two nodes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default)]
    pub id: String,

    pub source: String,

    pub target: String,

    /// Named output of the source (e.g. "condition-if", "error")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }

    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    /// Human readable label for error messages.
    pub fn label(&self) -> String {
        if self.id.is_empty() {
            format!("{}->{}", self.source, self.target)
        } else {
            self.id.clone()
        }
    }
}

/// How many times a group's interior runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Iteration {
    /// A fixed number of iterations
    Count { count: usize },

    /// One iteration per element; `items` is an array, a JSON-encoded
    /// array string, or a reference such as `<start.items>`
    Collection { items: Value },
}

impl Default for Iteration {
    fn default() -> Self {
        Iteration::Count { count: 1 }
    }
}

/// Kind of control group.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Loop,
    Parallel,
}

impl GroupKind {
    /// System reference prefix for the group kind.
    pub fn system_prefix(&self) -> &'static str {
        match self {
            GroupKind::Loop => "loop",
            GroupKind::Parallel => "parallel",
        }
    }
}

/// A sequentially repeated subgraph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoopGroup {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Node ids logically inside the loop (blocks or nested groups)
    pub nodes: Vec<String>,

    #[serde(default)]
    pub iteration: Iteration,
}

impl LoopGroup {
    pub fn new(id: impl Into<String>, nodes: Vec<String>, iteration: Iteration) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            nodes,
            iteration,
        }
    }
}

/// A concurrently fanned-out subgraph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub nodes: Vec<String>,

    #[serde(default)]
    pub iteration: Iteration,

    /// Upper bound on iterations in flight at once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl ParallelGroup {
    pub fn new(id: impl Into<String>, nodes: Vec<String>, iteration: Iteration) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            nodes,
            iteration,
            max_concurrency: None,
        }
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }
}

/// The serialized graph handed over by the editor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub blocks: Vec<Block>,

    #[serde(default)]
    pub edges: Vec<Edge>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loops: Vec<LoopGroup>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallels: Vec<ParallelGroup>,
}

impl WorkflowDefinition {
    /// Creates a new empty definition.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Adds a block, rejecting duplicate ids.
    pub fn add_block(&mut self, block: Block) -> Result<(), String> {
        if self.blocks.iter().any(|b| b.id == block.id) {
            return Err(format!("Block '{}' already exists", block.id));
        }
        self.blocks.push(block);
        Ok(())
    }

    /// Builder form of [`add_block`](Self::add_block); later duplicates are dropped.
    pub fn with_block(mut self, block: Block) -> Self {
        let _ = self.add_block(block);
        self
    }

    /// Adds an unconditional edge.
    pub fn connect(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(Edge::new(source, target));
        self
    }

    /// Adds an edge leaving a named output of the source.
    pub fn connect_handle(
        mut self,
        source: impl Into<String>,
        handle: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.edges
            .push(Edge::new(source, target).with_source_handle(handle));
        self
    }

    pub fn with_loop(mut self, group: LoopGroup) -> Self {
        self.loops.push(group);
        self
    }

    pub fn with_parallel(mut self, group: ParallelGroup) -> Self {
        self.parallels.push(group);
        self
    }

    /// Gets a block by id.
    pub fn get_block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Gets a mutable block by id.
    pub fn get_block_mut(&mut self, id: &str) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    /// Removes a block and every edge touching it.
    pub fn remove_block(&mut self, id: &str) -> Result<(), String> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| format!("Block '{}' not found", id))?;

        self.blocks.remove(index);
        self.edges.retain(|e| e.source != id && e.target != id);
        for group in &mut self.loops {
            group.nodes.retain(|n| n != id);
        }
        for group in &mut self.parallels {
            group.nodes.retain(|n| n != id);
        }
        Ok(())
    }

    /// Returns the number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if there are no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
