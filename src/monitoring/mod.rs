//! Monitoring Module
//!
//! Reporting over finished or paused runs.
//!
//! - [`ExecutionTimeline`]: block start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, TimelineEvent};
