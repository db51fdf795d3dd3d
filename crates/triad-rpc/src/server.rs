use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObject;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use triad_core::event::{EventKind, NewEvent};
use triad_core::task::{NewTask, Task};
use triad_core::types::{ModelId, Priority, TaskId, TaskState, TraceId};
use triad_queue::Scheduler;
use triad_store::Store;

use crate::api::TriadApiServer;
use crate::types::{RpcEvent, RpcNewTask, RpcQueueStats, RpcTask, RpcVersionInfo};

fn rpc_err(code: i32, msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(code, msg.into(), None::<()>)
}

/// Shared state passed to the RPC server.
pub struct RpcServerState {
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    /// Location of `health.json` (most recent supervisor snapshot).
    pub health_path: PathBuf,
}

pub struct RpcServer {
    state: Arc<RpcServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        Self { state }
    }

    /// Start the JSON-RPC server on `addr` with permissive CORS headers.
    /// Returns a handle to stop it.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let cors = CorsLayer::new()
            .allow_methods(Any)
            .allow_origin(Any)
            .allow_headers(Any);

        let server = Server::builder()
            .set_http_middleware(tower::ServiceBuilder::new().layer(cors))
            .build(addr)
            .await?;

        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "RPC server started");
        Ok(handle)
    }
}

fn task_to_rpc(task: Task) -> RpcTask {
    RpcTask {
        id: task.id.to_string(),
        name: task.name,
        task_type: task.task_type,
        priority: task.priority.as_str().to_string(),
        state: task.state.as_str().to_string(),
        worker_id: task.worker_id.map(|w| w.to_string()),
        created_at: task.created_at,
        updated_at: task.updated_at,
        started_at: task.started_at,
        completed_at: task.completed_at,
        retry_count: task.retry_count,
        max_retries: task.max_retries,
        parent_task_id: task.parent_task_id.map(|p| p.to_string()),
        result: task.result,
        error: task.error,
        trace_id: task.trace_id.to_string(),
    }
}

#[async_trait]
impl TriadApiServer for RpcServer {
    async fn submit_task(&self, task: RpcNewTask) -> RpcResult<String> {
        let priority = Priority::from_str(&task.priority)
            .map_err(|e| rpc_err(-32602, format!("invalid priority: {e}")))?;

        let mut new_task = NewTask::new(task.name, task.task_type, priority, task.payload);
        new_task.parent_task_id = task.parent_task_id.map(TaskId::from_string);
        new_task.assigned_model = task.assigned_model.map(ModelId::new);
        new_task.shard = task.shard;
        new_task.max_retries = task.max_retries;

        let trace = TraceId::from_env_or_generate();
        let now = chrono::Utc::now().timestamp();
        let id = self
            .state
            .scheduler
            .submit(new_task, trace, now)
            .map_err(|e| rpc_err(-32603, e.to_string()))?;
        Ok(id.to_string())
    }

    async fn get_task(&self, task_id: String) -> RpcResult<Option<RpcTask>> {
        let task = self
            .state
            .store
            .find_task(&TaskId::from_string(task_id))
            .map_err(|e| rpc_err(-32603, e.to_string()))?;
        Ok(task.map(task_to_rpc))
    }

    async fn get_events(&self, after_seq: i64, limit: u32) -> RpcResult<Vec<RpcEvent>> {
        let limit = limit.min(1_000);
        let events = self
            .state
            .store
            .events_after(after_seq, limit)
            .map_err(|e| rpc_err(-32603, e.to_string()))?;
        Ok(events
            .into_iter()
            .map(|e| RpcEvent {
                seq: e.seq,
                ts: e.ts,
                aggregate_type: e.aggregate_type,
                aggregate_id: e.aggregate_id,
                event_type: e.kind,
                payload: e.payload,
                trace_id: e.trace_id.to_string(),
            })
            .collect())
    }

    async fn get_health(&self) -> RpcResult<Option<serde_json::Value>> {
        match std::fs::read_to_string(&self.state.health_path) {
            Ok(text) => Ok(serde_json::from_str(&text).ok()),
            Err(_) => Ok(None),
        }
    }

    async fn get_queue_stats(&self) -> RpcResult<RpcQueueStats> {
        let store = &self.state.store;
        let count =
            |s: TaskState| store.count_in_state(s).map_err(|e| rpc_err(-32603, e.to_string()));
        Ok(RpcQueueStats {
            queued: count(TaskState::Queued)?,
            running: count(TaskState::Running)?,
            review: count(TaskState::Review)?,
            failed: count(TaskState::Failed)?,
            escalated: count(TaskState::Escalated)?,
            paused: store.is_paused().map_err(|e| rpc_err(-32603, e.to_string()))?,
            pause_reason: store
                .pause_reason()
                .map_err(|e| rpc_err(-32603, e.to_string()))?,
        })
    }

    async fn pause(&self, reason: Option<String>) -> RpcResult<bool> {
        let reason = reason.unwrap_or_else(|| "operator".to_string());
        self.state
            .store
            .set_paused(&reason)
            .map_err(|e| rpc_err(-32603, e.to_string()))?;
        let _ = self.state.store.append_event(
            &NewEvent::system(EventKind::SystemPaused, TraceId::from_env_or_generate())
                .with_payload(serde_json::json!({ "reason": reason })),
            chrono::Utc::now().timestamp(),
        );
        Ok(true)
    }

    async fn resume(&self) -> RpcResult<bool> {
        self.state
            .store
            .clear_paused()
            .map_err(|e| rpc_err(-32603, e.to_string()))?;
        let _ = self.state.store.append_event(
            &NewEvent::system(EventKind::SystemResumed, TraceId::from_env_or_generate()),
            chrono::Utc::now().timestamp(),
        );
        Ok(true)
    }

    async fn get_version(&self) -> RpcResult<RpcVersionInfo> {
        Ok(RpcVersionInfo {
            node_version: env!("CARGO_PKG_VERSION").to_string(),
            api_version: "1".to_string(),
        })
    }
}
