//! Workflow Execution Module
//!
//! Runs compiled workflows: scheduling, loop and parallel expansion,
//! bounded dispatch, and suspension on wait blocks.
//!
//! # Architecture
//!
//! - [`engine`]: The coordinator and its public [`Engine`] entry point
//! - [`step`]: One block dispatch on a worker task
//! - [`context`]: Mutable per-run state
//! - [`result`]: What a run reports back

pub mod context;
pub mod engine;
pub mod result;
pub mod step;

pub use context::{BlockState, ExecutionContext, GroupRun, StateKey};
pub use engine::{CancelHandle, Engine, ResumeRequest, RunRequest};
pub use result::{BlockLogEntry, ExecutionMetadata, ExecutionResult, RunStatus, WaitBlockInfo};
