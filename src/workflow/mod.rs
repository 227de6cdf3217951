//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating block graphs.
//!
//! # Structure
//!
//! - [`model`]: Serializable data structures (Block, Edge, groups)
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Structural rules and per-scope topological order
//! - [`graph`]: The compiled, immutable [`Workflow`]
//! - [`planner`]: Ready-set bookkeeping for one scope

pub mod graph;
pub mod model;
pub mod parser;
pub mod planner;
pub mod validator;

pub use graph::{GroupInfo, Workflow};
pub use model::{
    Block, Edge, GroupKind, Iteration, LoopGroup, ParallelGroup, Position, WorkflowDefinition,
};
pub use parser::{load_workflow, parse_workflow, save_workflow, WorkflowFormat};
pub use planner::{ExecutionPlanner, NodeStatus, PlanEdge, ScopePlan};
pub use validator::{quick_validate, validate_workflow};
