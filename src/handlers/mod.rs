//! Block Handlers
//!
//! The catalog of block implementations is open-ended: each block type tag
//! maps to a [`BlockHandler`] in a [`HandlerRegistry`]. Handlers are bound to
//! blocks once when a workflow is compiled, so the engine never branches on
//! type names.
//!
//! - [`registry`]: type tag to handler mapping, plus the process-wide default
//! - [`builtin`]: blocks the engine ships with (starter, condition, wait, ...)

pub mod builtin;
pub mod registry;

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReferenceError;
use crate::references::ReferenceResolver;
use crate::workflow::Block;

pub use registry::{default_registry, HandlerRegistry};

/// Error type handlers may return.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Result of a handler invocation.
pub type HandlerResult = Result<BlockOutcome, HandlerError>;

/// Normal output of a block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockOutput {
    /// Structured result, addressable through references
    pub output: Value,

    /// Named output selected by routing blocks (e.g. "condition-if")
    pub selected_handle: Option<String>,

    /// Workflow variables to assign once the block completes
    pub variable_updates: Vec<(String, Value)>,
}

impl BlockOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            selected_handle: None,
            variable_updates: Vec::new(),
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.selected_handle = Some(handle.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variable_updates.push((name.into(), value));
        self
    }
}

/// A request to suspend the run until an external event arrives.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitRequest {
    pub reason: String,

    #[serde(default)]
    pub payload: Value,
}

/// What a handler hands back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    Completed(BlockOutput),
    Wait(WaitRequest),
}

impl BlockOutcome {
    /// Shorthand for a completed block with a plain output.
    pub fn output(value: Value) -> Self {
        BlockOutcome::Completed(BlockOutput::new(value))
    }
}

/// Read-only view of the run handed to a handler.
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub block_id: String,
    pub block_name: String,
    /// Iteration indices of every enclosing loop/parallel group, outermost first
    pub iteration: Vec<usize>,
    pub workflow_input: Value,
    pub workflow_variables: HashMap<String, Value>,
    pub environment_variables: Arc<HashMap<String, String>>,
    pub is_deployed_context: bool,
    pub workspace_id: Option<String>,
}

/// Capability interface every block type implements.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    /// Type tag this handler serves.
    fn block_type(&self) -> &str;

    /// Whether blocks of this type are run entry points (starters, triggers).
    fn is_entry(&self) -> bool {
        false
    }

    /// Turns the block's config into handler inputs.
    fn resolve_inputs(
        &self,
        block: &Block,
        resolver: &ReferenceResolver<'_>,
    ) -> Result<Value, ReferenceError> {
        resolver.resolve_block_inputs(block)
    }

    /// Executes the block with its references already resolved into `inputs`.
    async fn execute(&self, block: &Block, inputs: &Value, ctx: &BlockContext) -> HandlerResult;
}
