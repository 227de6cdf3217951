//! Execution Context
//!
//! The mutable record of one run: per-block results keyed by block id and
//! iteration path, the executed/skipped sets, variables, and the group
//! iteration parameters fixed when each group opened.
//!
//! Only the coordinator mutates a context; dispatched blocks receive a
//! [`BlockContext`] snapshot instead.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handlers::BlockContext;
use crate::workflow::Workflow;

/// Address of one block (or group) instance: its id plus the iteration
/// index of every enclosing group, outermost first.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct StateKey {
    pub block_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iteration: Vec<usize>,
}

impl StateKey {
    pub fn new(block_id: impl Into<String>, iteration: Vec<usize>) -> Self {
        Self {
            block_id: block_id.into(),
            iteration,
        }
    }

    /// Key of a block outside every group.
    pub fn root(block_id: impl Into<String>) -> Self {
        Self::new(block_id, Vec::new())
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.iteration.is_empty() {
            write!(f, "{}", self.block_id)
        } else {
            let path: Vec<String> = self.iteration.iter().map(|i| i.to_string()).collect();
            write!(f, "{}[{}]", self.block_id, path.join("."))
        }
    }
}

/// Result of one block instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockState {
    pub output: Value,

    pub executed: bool,

    #[serde(default)]
    pub execution_time_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,

    /// Completion order within the run
    #[serde(default)]
    pub sequence: u64,

    /// Output handle the block selected, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_handle: Option<String>,
}

impl BlockState {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            executed: true,
            execution_time_ms: 0,
            started_at: None,
            ended_at: None,
            sequence: 0,
            selected_handle: None,
        }
    }

    pub fn with_timing(mut self, started_at: DateTime<Utc>, ended_at: DateTime<Utc>, ms: u64) -> Self {
        self.started_at = Some(started_at);
        self.ended_at = Some(ended_at);
        self.execution_time_ms = ms;
        self
    }

    pub fn with_handle(mut self, handle: Option<String>) -> Self {
        self.selected_handle = handle;
        self
    }
}

/// Iteration parameters of one group instance, fixed when it opens.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupRun {
    pub total: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Value>>,
}

impl GroupRun {
    /// Value bound to `currentItem` for an iteration.
    pub fn current_item(&self, index: usize) -> Value {
        match &self.items {
            Some(items) => items.get(index).cloned().unwrap_or(Value::Null),
            None => Value::from(index),
        }
    }
}

/// Mutable state of one run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub block_states: HashMap<StateKey, BlockState>,
    /// Ids of blocks and groups that have run at least once
    pub executed_blocks: BTreeSet<String>,
    /// Ids of blocks skipped by conditional routing
    pub skipped_blocks: BTreeSet<String>,
    pub environment_variables: Arc<HashMap<String, String>>,
    pub workflow_variables: HashMap<String, Value>,
    pub workflow_input: Value,
    pub is_deployed_context: bool,
    pub workspace_id: Option<String>,
    pub group_runs: HashMap<StateKey, GroupRun>,
    /// Instances in completion order
    pub execution_order: Vec<StateKey>,
    pub sequence: u64,
    workflow: Arc<Workflow>,
}

impl ExecutionContext {
    pub fn new(
        workflow: Arc<Workflow>,
        execution_id: impl Into<String>,
        workflow_input: Value,
        environment_variables: HashMap<String, String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow.id().to_string(),
            block_states: HashMap::new(),
            executed_blocks: BTreeSet::new(),
            skipped_blocks: BTreeSet::new(),
            environment_variables: Arc::new(environment_variables),
            workflow_variables: HashMap::new(),
            workflow_input,
            is_deployed_context: false,
            workspace_id: None,
            group_runs: HashMap::new(),
            execution_order: Vec::new(),
            sequence: 0,
            workflow,
        }
    }

    /// The workflow this run executes.
    pub fn workflow(&self) -> &Arc<Workflow> {
        &self.workflow
    }

    pub fn state(&self, key: &StateKey) -> Option<&BlockState> {
        self.block_states.get(key)
    }

    pub fn has_state(&self, key: &StateKey) -> bool {
        self.block_states.contains_key(key)
    }

    /// State of `node` as seen from an instance at `path`.
    ///
    /// The node's own key uses the prefix of `path` as deep as the node is
    /// nested, so outer results are shared by every inner iteration.
    pub fn state_from(&self, node: &str, path: &[usize]) -> Option<&BlockState> {
        let depth = self.workflow.depth(node);
        if path.len() < depth {
            return None;
        }
        self.block_states
            .get(&StateKey::new(node, path[..depth].to_vec()))
    }

    /// Records a finished instance and returns its completion sequence.
    pub fn store(&mut self, key: StateKey, mut state: BlockState) -> u64 {
        self.sequence += 1;
        state.sequence = self.sequence;
        self.executed_blocks.insert(key.block_id.clone());
        self.execution_order.push(key.clone());
        self.block_states.insert(key, state);
        self.sequence
    }

    pub fn mark_skipped(&mut self, block_id: &str) {
        self.skipped_blocks.insert(block_id.to_string());
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.workflow_variables.insert(name.into(), value);
    }

    /// Read-only view handed to a block's handler.
    pub fn block_context(&self, key: &StateKey) -> BlockContext {
        let block_name = self
            .workflow
            .reference_name(&key.block_id)
            .to_string();

        BlockContext {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            block_id: key.block_id.clone(),
            block_name,
            iteration: key.iteration.clone(),
            workflow_input: self.workflow_input.clone(),
            workflow_variables: self.workflow_variables.clone(),
            environment_variables: Arc::clone(&self.environment_variables),
            is_deployed_context: self.is_deployed_context,
            workspace_id: self.workspace_id.clone(),
        }
    }
}
