use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use crate::types::{RpcEvent, RpcNewTask, RpcQueueStats, RpcTask, RpcVersionInfo};

/// Triad JSON-RPC 2.0 API definition.
///
/// All method names are prefixed with "triad_" via `namespace = "triad"`.
#[rpc(server, namespace = "triad")]
pub trait TriadApi {
    /// Submit a task; returns the assigned task id.
    #[method(name = "submitTask")]
    async fn submit_task(&self, task: RpcNewTask) -> RpcResult<String>;

    /// Fetch one task by id.
    #[method(name = "getTask")]
    async fn get_task(&self, task_id: String) -> RpcResult<Option<RpcTask>>;

    /// Read the append-only event log strictly after `after_seq`,
    /// oldest first, at most `limit` records.
    #[method(name = "getEvents")]
    async fn get_events(&self, after_seq: i64, limit: u32) -> RpcResult<Vec<RpcEvent>>;

    /// The most recent health snapshot, if one has been produced.
    #[method(name = "getHealth")]
    async fn get_health(&self) -> RpcResult<Option<serde_json::Value>>;

    /// Queue depth and state counters plus the pause flag.
    #[method(name = "getQueueStats")]
    async fn get_queue_stats(&self) -> RpcResult<RpcQueueStats>;

    /// Set the global pause flag. New claims return none; running tasks
    /// are not killed.
    #[method(name = "pause")]
    async fn pause(&self, reason: Option<String>) -> RpcResult<bool>;

    /// Clear the global pause flag.
    #[method(name = "resume")]
    async fn resume(&self) -> RpcResult<bool>;

    #[method(name = "getVersion")]
    async fn get_version(&self) -> RpcResult<RpcVersionInfo>;
}
