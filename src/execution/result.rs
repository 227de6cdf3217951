//! Execution Results
//!
//! What a run hands back to its caller: the final output, per-block logs,
//! and run metadata. Serialized in camelCase for API consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::StateKey;

/// Lifecycle of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl RunStatus {
    /// Whether the run can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

/// One dispatched block instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockLogEntry {
    pub block_id: String,
    pub block_name: String,
    pub block_type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iteration: Vec<usize>,

    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BlockLogEntry {
    /// Instance label, e.g. `agent` or `agent[2]`.
    pub fn label(&self) -> String {
        StateKey::new(self.block_id.clone(), self.iteration.clone()).to_string()
    }
}

/// The wait block a paused run is suspended on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WaitBlockInfo {
    pub block_id: String,
    pub block_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iteration: Vec<usize>,

    pub reason: String,

    #[serde(default)]
    pub payload: Value,
}

impl WaitBlockInfo {
    pub fn key(&self) -> StateKey {
        StateKey::new(self.block_id.clone(), self.iteration.clone())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub duration_ms: u64,
    pub executed_block_count: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_block_info: Option<WaitBlockInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_block_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unresolved_token: Option<String>,

    /// Times this execution id has paused so far
    #[serde(default)]
    pub pause_count: u32,
}

/// Outcome of [`Engine::execute`](super::Engine::execute) or
/// [`Engine::resume`](super::Engine::resume).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub workflow_id: String,
    pub success: bool,
    pub output: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    pub logs: Vec<BlockLogEntry>,
    pub is_paused: bool,
    pub status: RunStatus,

    /// Blocks and groups that ran, sorted
    pub executed_blocks: Vec<String>,

    /// Blocks skipped by conditional routing, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_blocks: Vec<String>,

    pub metadata: ExecutionMetadata,
}

impl ExecutionResult {
    /// Log entries for one block id across all iterations.
    pub fn logs_for<'a>(&'a self, block_id: &'a str) -> impl Iterator<Item = &'a BlockLogEntry> {
        self.logs.iter().filter(move |l| l.block_id == block_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, iteration: Vec<usize>) -> BlockLogEntry {
        let now = Utc::now();
        BlockLogEntry {
            block_id: id.to_string(),
            block_name: id.to_string(),
            block_type: "response".to_string(),
            iteration,
            started_at: now,
            ended_at: now,
            duration_ms: 0,
            success: true,
            output: Some(json!(1)),
            error: None,
        }
    }

    #[test]
    fn test_status_terminal() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert_eq!(RunStatus::Paused.to_string(), "paused");
    }

    #[test]
    fn test_log_label() {
        assert_eq!(entry("a", vec![]).label(), "a");
        assert_eq!(entry("a", vec![1]).label(), "a[1]");
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let now = Utc::now();
        let result = ExecutionResult {
            execution_id: "e".to_string(),
            workflow_id: "w".to_string(),
            success: true,
            output: json!({"ok": true}),
            error: None,
            error_code: None,
            logs: vec![entry("a", vec![])],
            is_paused: false,
            status: RunStatus::Completed,
            executed_blocks: vec!["a".to_string()],
            skipped_blocks: vec![],
            metadata: ExecutionMetadata {
                duration_ms: 5,
                executed_block_count: 1,
                start_time: now,
                end_time: now,
                wait_block_info: None,
                failed_block_id: None,
                unresolved_token: None,
                pause_count: 0,
            },
        };

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["isPaused"], false);
        assert_eq!(value["metadata"]["executedBlockCount"], 1);
        assert_eq!(value["status"], "completed");
        assert!(value.get("error").is_none());
        assert_eq!(result.logs_for("a").count(), 1);
    }
}
