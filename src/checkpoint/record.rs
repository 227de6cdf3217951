//! Checkpoint Records
//!
//! The serialized form of a paused run. Maps become sorted arrays of
//! entries so a checkpoint is plain, portable JSON that any process with
//! the same handler catalog can resume.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CheckpointError;
use crate::execution::context::{BlockState, ExecutionContext, GroupRun, StateKey};
use crate::execution::result::{BlockLogEntry, WaitBlockInfo};
use crate::workflow::{Workflow, WorkflowDefinition};

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Rejects ids that could escape a storage directory.
pub fn validate_execution_id(id: &str) -> Result<(), CheckpointError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidId(id.to_string()))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeyValue<V> {
    pub key: String,
    pub value: V,
}

fn sorted_entries<V: Clone>(map: &HashMap<String, V>) -> Vec<KeyValue<V>> {
    let mut entries: Vec<KeyValue<V>> = map
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockStateEntry {
    pub block_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iteration: Vec<usize>,

    pub state: BlockState,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupRunEntry {
    pub group_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iteration: Vec<usize>,

    pub run: GroupRun,
}

/// Serializable copy of an [`ExecutionContext`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub block_states: Vec<BlockStateEntry>,
    pub executed_blocks: Vec<String>,

    #[serde(default)]
    pub skipped_blocks: Vec<String>,

    #[serde(default)]
    pub workflow_variables: Vec<KeyValue<Value>>,

    #[serde(default)]
    pub group_runs: Vec<GroupRunEntry>,

    #[serde(default)]
    pub execution_order: Vec<StateKey>,

    #[serde(default)]
    pub sequence: u64,

    #[serde(default)]
    pub is_deployed_context: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

impl ContextSnapshot {
    /// Copies a live context into sorted, serializable form.
    pub fn capture(ctx: &ExecutionContext) -> Self {
        let mut block_states: Vec<BlockStateEntry> = ctx
            .block_states
            .iter()
            .map(|(key, state)| BlockStateEntry {
                block_id: key.block_id.clone(),
                iteration: key.iteration.clone(),
                state: state.clone(),
            })
            .collect();
        block_states.sort_by(|a, b| (&a.block_id, &a.iteration).cmp(&(&b.block_id, &b.iteration)));

        let mut group_runs: Vec<GroupRunEntry> = ctx
            .group_runs
            .iter()
            .map(|(key, run)| GroupRunEntry {
                group_id: key.block_id.clone(),
                iteration: key.iteration.clone(),
                run: run.clone(),
            })
            .collect();
        group_runs.sort_by(|a, b| (&a.group_id, &a.iteration).cmp(&(&b.group_id, &b.iteration)));

        Self {
            block_states,
            executed_blocks: ctx.executed_blocks.iter().cloned().collect(),
            skipped_blocks: ctx.skipped_blocks.iter().cloned().collect(),
            workflow_variables: sorted_entries(&ctx.workflow_variables),
            group_runs,
            execution_order: ctx.execution_order.clone(),
            sequence: ctx.sequence,
            is_deployed_context: ctx.is_deployed_context,
            workspace_id: ctx.workspace_id.clone(),
        }
    }

    /// Rebuilds a live context for `workflow`.
    pub fn restore(
        self,
        workflow: Arc<Workflow>,
        execution_id: &str,
        workflow_input: Value,
        environment_variables: HashMap<String, String>,
    ) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            workflow,
            execution_id,
            workflow_input,
            environment_variables,
        );

        ctx.block_states = self
            .block_states
            .into_iter()
            .map(|entry| (StateKey::new(entry.block_id, entry.iteration), entry.state))
            .collect();
        ctx.group_runs = self
            .group_runs
            .into_iter()
            .map(|entry| (StateKey::new(entry.group_id, entry.iteration), entry.run))
            .collect();
        ctx.executed_blocks = self.executed_blocks.into_iter().collect();
        ctx.skipped_blocks = self.skipped_blocks.into_iter().collect();
        ctx.workflow_variables = self
            .workflow_variables
            .into_iter()
            .map(|kv| (kv.key, kv.value))
            .collect();
        ctx.execution_order = self.execution_order;
        ctx.sequence = self.sequence;
        ctx.is_deployed_context = self.is_deployed_context;
        ctx.workspace_id = self.workspace_id;
        ctx
    }
}

/// Run bookkeeping carried across a pause.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    pub started_at: DateTime<Utc>,
    pub paused_at: DateTime<Utc>,
    pub wait_block: WaitBlockInfo,

    /// Instances that were ready but not dispatched
    #[serde(default)]
    pub ready_blocks: Vec<StateKey>,

    #[serde(default)]
    pub pause_count: u32,

    #[serde(default)]
    pub logs: Vec<BlockLogEntry>,
}

/// A paused run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub version: u32,
    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_state: WorkflowDefinition,
    pub execution_context: ContextSnapshot,
    pub environment_variables: Vec<KeyValue<String>>,

    #[serde(default)]
    pub workflow_input: Value,

    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Captures a paused context.
    pub fn capture(ctx: &ExecutionContext, metadata: CheckpointMetadata) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            execution_id: ctx.execution_id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            workflow_state: ctx.workflow().definition().clone(),
            execution_context: ContextSnapshot::capture(ctx),
            environment_variables: sorted_entries(&ctx.environment_variables),
            workflow_input: ctx.workflow_input.clone(),
            metadata,
        }
    }

    pub fn environment(&self) -> HashMap<String, String> {
        self.environment_variables
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect()
    }

    pub fn to_json(&self) -> Result<String, CheckpointError> {
        serde_json::to_string_pretty(self).map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    /// Parses a checkpoint and checks its format version.
    pub fn from_json(content: &str) -> Result<Self, CheckpointError> {
        let checkpoint: Checkpoint = serde_json::from_str(content)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        Ok(checkpoint)
    }
}
