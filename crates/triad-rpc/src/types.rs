use serde::{Deserialize, Serialize};

/// Submission body for `triad_submitTask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNewTask {
    pub name: String,
    pub task_type: String,
    /// CRITICAL | HIGH | MEDIUM | LOW
    pub priority: String,
    pub payload: String,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub assigned_model: Option<String>,
    #[serde(default)]
    pub shard: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Task view returned by `triad_getTask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcTask {
    pub id: String,
    pub name: String,
    pub task_type: String,
    pub priority: String,
    pub state: String,
    pub worker_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub parent_task_id: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub trace_id: String,
}

/// One append-only event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEvent {
    pub seq: i64,
    pub ts: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcQueueStats {
    pub queued: u64,
    pub running: u64,
    pub review: u64,
    pub failed: u64,
    pub escalated: u64,
    pub paused: bool,
    pub pause_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcVersionInfo {
    pub node_version: String,
    pub api_version: String,
}
