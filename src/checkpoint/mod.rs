//! Checkpointing Module
//!
//! Durable pause/resume for runs suspended on a wait block.
//!
//! - [`record`]: the portable checkpoint format
//! - [`store`]: memory and file-backed storage
//! - [`service`]: the pause/resume handoff used by the engine

pub mod record;
pub mod service;
pub mod store;

pub use record::{Checkpoint, CheckpointMetadata, ContextSnapshot, CHECKPOINT_VERSION};
pub use service::{PauseResumeService, ResumedRun};
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
