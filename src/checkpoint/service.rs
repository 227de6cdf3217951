//! Pause/Resume Service
//!
//! Hands a paused run from the engine to storage and back. Resuming takes
//! the checkpoint out of the store, so a pause event can be resumed at most
//! once; a run that waits again is paused under the same execution id.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};
use serde_json::{json, Map, Value};

use super::record::{validate_execution_id, Checkpoint, CheckpointMetadata};
use super::store::{CheckpointStore, MemoryCheckpointStore};
use crate::error::{CheckpointError, EngineError};
use crate::execution::context::{BlockState, ExecutionContext};
use crate::handlers::HandlerRegistry;
use crate::workflow::Workflow;

/// A paused run rebuilt and ready to continue.
#[derive(Debug)]
pub struct ResumedRun {
    pub workflow: Arc<Workflow>,
    pub context: ExecutionContext,
    pub metadata: CheckpointMetadata,
}

/// Output recorded for the wait block when its run resumes.
///
/// Object keys of `extra_inputs` are exposed at the top level next to the
/// fixed `resumed`, `resumeInput` and `waitPayload` fields.
pub fn resume_output(extra_inputs: &Value, wait_payload: &Value) -> Value {
    let mut output = match extra_inputs {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    output.insert("resumed".to_string(), json!(true));
    output.insert("resumeInput".to_string(), extra_inputs.clone());
    output.insert("waitPayload".to_string(), wait_payload.clone());
    Value::Object(output)
}

/// Membership of an execution id in an in-flight set, released on drop
/// even if the owning future is dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    execution_id: String,
}

impl<'a> InFlight<'a> {
    /// `None` when the id is already in the set.
    fn claim(set: &'a Mutex<HashSet<String>>, execution_id: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(execution_id.to_string());
        inserted.then(|| Self {
            set,
            execution_id: execution_id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.execution_id);
    }
}

pub struct PauseResumeService {
    store: Arc<dyn CheckpointStore>,
    /// Ids whose pause is being written
    pending: Mutex<HashSet<String>>,
    /// Ids whose checkpoint is being taken
    resuming: Mutex<HashSet<String>>,
}

impl Default for PauseResumeService {
    fn default() -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::new()))
    }
}

impl PauseResumeService {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            pending: Mutex::new(HashSet::new()),
            resuming: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    fn is_pending(&self, execution_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(execution_id)
    }

    /// Persists a paused run, replacing any earlier checkpoint for the id.
    pub async fn pause_execution(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        validate_execution_id(&checkpoint.execution_id)?;

        let Some(_guard) = InFlight::claim(&self.pending, &checkpoint.execution_id) else {
            return Err(CheckpointError::Busy(checkpoint.execution_id.clone()));
        };

        self.store.save(checkpoint).await?;
        info!(
            "Execution '{}' paused at '{}' (pause #{})",
            checkpoint.execution_id,
            checkpoint.metadata.wait_block.key(),
            checkpoint.metadata.pause_count
        );
        Ok(())
    }

    /// Takes the checkpoint of a paused run out of the store.
    ///
    /// Returns `Ok(None)` for an unknown id, and `Busy` while the pause is
    /// still being written or another resume of the id is taking it.
    pub async fn resume_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        validate_execution_id(execution_id)?;
        if self.is_pending(execution_id) {
            return Err(CheckpointError::Busy(execution_id.to_string()));
        }
        let Some(_guard) = InFlight::claim(&self.resuming, execution_id) else {
            return Err(CheckpointError::Busy(execution_id.to_string()));
        };

        let checkpoint = self.store.take(execution_id).await?;
        match &checkpoint {
            Some(cp) => debug!(
                "Took checkpoint for '{}' ({} stored states)",
                execution_id,
                cp.execution_context.block_states.len()
            ),
            None => debug!("No checkpoint stored for '{}'", execution_id),
        }
        Ok(checkpoint)
    }

    /// Whether a checkpoint is stored for the id.
    pub async fn is_paused(&self, execution_id: &str) -> Result<bool, CheckpointError> {
        Ok(self.store.load(execution_id).await?.is_some())
    }

    /// Ids of every paused run.
    pub async fn paused_executions(&self) -> Result<Vec<String>, CheckpointError> {
        self.store.list().await
    }

    /// Rebuilds a paused run from its checkpoint.
    ///
    /// The workflow is recompiled against `registry`, the context restored,
    /// and the wait block's output recorded from `extra_inputs`.
    pub fn create_from_paused_state(
        checkpoint: Checkpoint,
        extra_inputs: Value,
        registry: &HandlerRegistry,
    ) -> Result<ResumedRun, EngineError> {
        let environment = checkpoint.environment();
        let workflow = Arc::new(Workflow::compile(checkpoint.workflow_state, registry)?);

        let mut context = checkpoint.execution_context.restore(
            Arc::clone(&workflow),
            &checkpoint.execution_id,
            checkpoint.workflow_input,
            environment,
        );

        let wait = &checkpoint.metadata.wait_block;
        let output = resume_output(&extra_inputs, &wait.payload);
        context.store(wait.key(), BlockState::new(output));

        info!(
            "Resuming execution '{}' after wait block '{}'",
            checkpoint.execution_id,
            wait.key()
        );

        Ok(ResumedRun {
            workflow,
            context,
            metadata: checkpoint.metadata,
        })
    }
}
