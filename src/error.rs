//! Error Types
//!
//! Every error carries the originating block (or edge/group) id and, for
//! references, the raw token, so callers can point at the failure without
//! re-deriving context.

use thiserror::Error;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// A malformed graph, detected when the workflow is loaded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StructuralError {
    #[error("Workflow has no blocks")]
    EmptyWorkflow,

    #[error("Block has empty or whitespace-only ID")]
    EmptyBlockId,

    #[error("Duplicate node ID: '{0}'")]
    DuplicateId(String),

    #[error("Edge '{edge}' references unknown node '{endpoint}'")]
    UnknownEdgeEndpoint { edge: String, endpoint: String },

    #[error("Workflow has no entry block (a starter or trigger block)")]
    MissingEntryBlock,

    #[error("Workflow has more than one entry block: {0:?}")]
    MultipleEntryBlocks(Vec<String>),

    #[error("Entry block '{block}' has incoming edge '{edge}'")]
    EntryHasIncomingEdge { block: String, edge: String },

    #[error("Entry block '{block}' cannot live inside group '{group}'")]
    EntryInsideGroup { block: String, group: String },

    #[error("Cyclic dependency between nodes {0:?} (cycles are only allowed through loop/parallel groups)")]
    CyclicDependency(Vec<String>),

    #[error("Group '{group}' lists unknown member '{member}'")]
    UnknownGroupMember { group: String, member: String },

    #[error("Node '{node}' belongs to both group '{first}' and group '{second}'")]
    OverlappingGroups {
        node: String,
        first: String,
        second: String,
    },

    #[error("Group '{0}' contains itself")]
    SelfNestedGroup(String),

    #[error("Edge '{edge}' crosses the boundary of group '{group}'")]
    EdgeCrossesGroup { edge: String, group: String },

    #[error("Reference name '{name}' is used by both '{first}' and '{second}'")]
    DuplicateReferenceName {
        name: String,
        first: String,
        second: String,
    },

    #[error("Reference name '{name}' of '{node}' is reserved")]
    ReservedReferenceName { node: String, name: String },

    #[error("Block '{block}' has unknown type '{block_type}'")]
    UnknownBlockType { block: String, block_type: String },

    #[error("Group '{group}' has an invalid iteration: {reason}")]
    InvalidIteration { group: String, reason: String },
}

/// A reference token that could not be resolved.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Block '{block_id}' could not resolve reference '{token}': {reason}")]
pub struct ReferenceError {
    pub block_id: String,
    pub token: String,
    pub reason: String,
}

impl ReferenceError {
    pub fn new(
        block_id: impl Into<String>,
        token: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            block_id: block_id.into(),
            token: token.into(),
            reason: reason.into(),
        }
    }
}

/// The dispatched block itself failed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Block '{block_id}' failed: {message}")]
pub struct BlockExecutionError {
    pub block_id: String,
    pub message: String,
}

impl BlockExecutionError {
    pub fn new(block_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            message: message.into(),
        }
    }
}

/// Failures of the checkpoint store or the pause/resume handoff.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckpointError {
    #[error("No paused execution found for id '{0}'")]
    NotFound(String),

    #[error("Invalid execution id '{0}'")]
    InvalidId(String),

    #[error("Checkpoint for execution '{0}' is being written; retry the resume later")]
    Busy(String),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(String),

    #[error("Checkpoint storage error: {0}")]
    Storage(String),

    #[error("Unsupported checkpoint version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Umbrella error returned by the engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    BlockExecution(#[from] BlockExecutionError),

    #[error("No paused execution found for id '{execution_id}'")]
    CheckpointNotFound { execution_id: String },

    #[error(transparent)]
    Checkpoint(CheckpointError),

    #[error("Execution cancelled{}", .block_id.as_ref().map(|b| format!(" before block '{}'", b)).unwrap_or_default())]
    Cancelled { block_id: Option<String> },

    #[error("Workflow parse error: {0}")]
    Parse(String),
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::NotFound(execution_id) => Self::CheckpointNotFound { execution_id },
            other => Self::Checkpoint(other),
        }
    }
}

impl EngineError {
    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Structural(_) => "STRUCTURAL_ERROR",
            Self::Reference(_) => "REFERENCE_ERROR",
            Self::BlockExecution(_) => "BLOCK_EXECUTION_ERROR",
            Self::CheckpointNotFound { .. } => "CHECKPOINT_NOT_FOUND",
            Self::Checkpoint(_) => "CHECKPOINT_ERROR",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Parse(_) => "PARSE_ERROR",
        }
    }

    /// Block the error originated from, when there is one.
    pub fn block_id(&self) -> Option<&str> {
        match self {
            Self::Reference(e) => Some(&e.block_id),
            Self::BlockExecution(e) => Some(&e.block_id),
            Self::Cancelled { block_id } => block_id.as_deref(),
            _ => None,
        }
    }

    /// Raw unresolved token for reference failures.
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Reference(e) => Some(&e.token),
            _ => None,
        }
    }

    /// Whether the caller can reasonably retry or fix the inputs.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Reference(_) | Self::BlockExecution(_))
    }
}
