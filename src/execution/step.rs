//! Individual Block Execution
//!
//! Runs one block's handler with its already-resolved inputs and times it.
//! The handler runs on its own task so a panic inside it surfaces as a
//! block failure instead of tearing down the coordinator.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::debug;
use serde_json::Value;

use crate::handlers::{BlockContext, BlockHandler, BlockOutcome};
use crate::workflow::Block;

/// Result and timing of one dispatch.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub outcome: Result<BlockOutcome, String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Executes a single block.
///
/// # Arguments
///
/// * `handler` - Handler bound to the block's type
/// * `block` - The block being run
/// * `inputs` - Config with every reference substituted
/// * `ctx` - Read-only view of the run
pub async fn execute_step(
    handler: Arc<dyn BlockHandler>,
    block: Block,
    inputs: Value,
    ctx: BlockContext,
) -> StepReport {
    let started_at = Utc::now();
    let clock = Instant::now();
    let label = if ctx.iteration.is_empty() {
        block.id.clone()
    } else {
        format!("{}{:?}", block.id, ctx.iteration)
    };

    debug!("Block '{}' ({}) starting", label, block.block_type);

    let task = tokio::spawn(async move {
        handler
            .execute(&block, &inputs, &ctx)
            .await
            .map_err(|e| e.to_string())
    });

    let outcome = match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(format!("handler panicked: {}", panic_message(e))),
        Err(e) => Err(format!("handler task aborted: {}", e)),
    };

    let duration_ms = clock.elapsed().as_millis() as u64;
    debug!("Block '{}' finished in {} ms", label, duration_ms);

    StepReport {
        outcome,
        started_at,
        ended_at: Utc::now(),
        duration_ms,
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
