use serde::{Deserialize, Serialize};

use crate::checksum::payload_checksum;
use crate::constants::DEFAULT_MAX_RETRIES;
use crate::types::{ModelId, Priority, TaskId, TaskState, Timestamp, TraceId, WorkerId};

// ── Task ─────────────────────────────────────────────────────────────────────

/// A scheduled unit of work. Persisted in the `tasks` table; the struct is
/// the hydrated row.
///
/// Invariants maintained by the store:
///   - `worker_id.is_some()` ⇔ `state == Running`
///   - `retry_count <= max_retries`; the scheduler escalates past the cap
///   - every state change is a legal matrix edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub task_type: String,
    pub priority: Priority,
    pub state: TaskState,
    pub lane: Option<String>,
    pub shard: Option<String>,
    pub assigned_model: Option<ModelId>,
    pub worker_id: Option<WorkerId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub parent_task_id: Option<TaskId>,
    /// Opaque input text plus caller metadata.
    pub payload: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub trace_id: TraceId,
    pub heartbeat_at: Option<Timestamp>,
    pub last_activity_at: Option<Timestamp>,
    /// blake3 of `payload`, used for replay detection.
    pub checksum: String,
    /// Serialized `Checkpoint` written when the task was preempted.
    pub checkpoint: Option<String>,
}

// ── NewTask ──────────────────────────────────────────────────────────────────

/// What a caller supplies at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub task_type: String,
    pub priority: Priority,
    pub payload: String,
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,
    #[serde(default)]
    pub assigned_model: Option<ModelId>,
    #[serde(default)]
    pub shard: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        priority: Priority,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            priority,
            payload: payload.into(),
            parent_task_id: None,
            assigned_model: None,
            shard: None,
            max_retries: None,
        }
    }

    /// Materialize into a fresh QUEUED task.
    pub fn into_task(self, now: Timestamp, trace_id: TraceId) -> Task {
        let checksum = payload_checksum(&self.payload);
        Task {
            id: TaskId::generate(),
            name: self.name,
            task_type: self.task_type,
            priority: self.priority,
            state: TaskState::Queued,
            lane: None,
            shard: self.shard,
            assigned_model: self.assigned_model,
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            parent_task_id: self.parent_task_id,
            payload: self.payload,
            result: None,
            error: None,
            trace_id,
            heartbeat_at: None,
            last_activity_at: Some(now),
            checksum,
            checkpoint: None,
        }
    }
}

// ── Checkpoint ───────────────────────────────────────────────────────────────

/// Snapshot persisted when a running task is preempted by a higher-priority
/// arrival. Completed work is never rolled back; the checkpoint only records
/// where the run stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: TaskId,
    pub payload_checksum: String,
    /// First `CHECKPOINT_PREVIEW_CHARS` characters of the payload.
    pub preview: String,
    pub reason: String,
    pub preempted_by: TaskId,
    pub at: Timestamp,
}

// ── Worker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Stopping,
    Dead,
    Crashed,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
            Self::Dead => "dead",
            Self::Crashed => "crashed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "stopping" => Some(Self::Stopping),
            "dead" => Some(Self::Dead),
            "crashed" => Some(Self::Crashed),
            _ => None,
        }
    }
}

/// A registered worker process/loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub pid: u32,
    pub status: WorkerStatus,
    pub specialization: Option<String>,
    pub shard: Option<String>,
    pub model: Option<ModelId>,
    pub started_at: Timestamp,
    pub last_heartbeat: Timestamp,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub crash_count: u32,
    pub current_task: Option<TaskId>,
}

impl Worker {
    /// A worker is stale once its heartbeat is older than `threshold_secs`.
    pub fn is_stale(&self, now: Timestamp, threshold_secs: i64) -> bool {
        now - self.last_heartbeat >= threshold_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_materializes_queued_with_checksum() {
        let t = NewTask::new("build-feature", "IMPLEMENTATION", Priority::High, "write foo()")
            .into_task(1_000, TraceId::generate());
        assert_eq!(t.state, TaskState::Queued);
        assert_eq!(t.retry_count, 0);
        assert!(t.worker_id.is_none());
        assert_eq!(t.checksum, payload_checksum("write foo()"));
        assert_eq!(t.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn worker_staleness_threshold() {
        let w = Worker {
            id: WorkerId::new("worker-1-42"),
            pid: 42,
            status: WorkerStatus::Busy,
            specialization: None,
            shard: None,
            model: None,
            started_at: 0,
            last_heartbeat: 1_000,
            tasks_completed: 0,
            tasks_failed: 0,
            crash_count: 0,
            current_task: None,
        };
        assert!(!w.is_stale(1_000 + 1_799, 1_800));
        assert!(w.is_stale(1_000 + 1_800, 1_800));
    }
}
