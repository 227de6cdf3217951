//! BlockRunner - Block Graph Workflow Engine
//!
//! Executes workflows described as graphs of typed blocks joined by edges,
//! with loop and parallel groups, conditional routing, references between
//! block outputs, and durable pause/resume on wait blocks.
//!
//! # Architecture
//!
//! - [`workflow`]: Definitions, parsing, validation and the compiled graph
//! - [`references`]: `<block.path>` and `{{ENV}}` token resolution
//! - [`execution`]: The coordinator that runs a workflow
//! - [`handlers`]: Block implementations and their registry
//! - [`checkpoint`]: Pause/resume storage
//! - [`monitoring`]: Execution timeline and Gantt charts
//! - [`config`]: Engine limits and environment overrides
//!
//! # Example
//!
//! ```rust,no_run
//! use blockrunner::{Engine, RunRequest};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new();
//!     let workflow = engine.load_file("flow.yaml")?;
//!
//!     let result = engine
//!         .execute(workflow, RunRequest::new().with_input(json!({"name": "Ada"})))
//!         .await?;
//!
//!     if result.is_paused {
//!         println!("Waiting; resume with id {}", result.execution_id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod execution;
pub mod handlers;
pub mod monitoring;
pub mod references;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use execution::{CancelHandle, Engine, ExecutionResult, ResumeRequest, RunRequest, RunStatus};
pub use handlers::{BlockContext, BlockHandler, BlockOutcome, BlockOutput, HandlerRegistry};
pub use workflow::{load_workflow, Block, Edge, Workflow, WorkflowDefinition};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "BlockRunner";
