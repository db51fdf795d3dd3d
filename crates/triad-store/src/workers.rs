//! Worker registry and heartbeats.

use rusqlite::{params, OptionalExtension};
use tracing::info;

use triad_core::event::{EventKind, NewEvent};
use triad_core::task::{Worker, WorkerStatus};
use triad_core::types::{ModelId, TaskId, Timestamp, TraceId, WorkerId};
use triad_core::TriadError;

use crate::db::Store;
use crate::events::insert_event_conn;

const WORKER_COLUMNS: &str = "id, pid, status, specialization, shard, model, started_at, \
     last_heartbeat, tasks_completed, tasks_failed, crash_count, current_task";

impl Store {
    /// Register (or re-register after a crash) a worker.
    pub fn register_worker(&self, worker: &Worker, trace: &TraceId) -> Result<(), TriadError> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT INTO workers (id, pid, status, specialization, shard, model, started_at, \
                 last_heartbeat, tasks_completed, tasks_failed, crash_count, current_task) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT (id) DO UPDATE SET pid = excluded.pid, status = excluded.status, \
                 started_at = excluded.started_at, last_heartbeat = excluded.last_heartbeat, \
                 crash_count = workers.crash_count + 1",
                params![
                    worker.id.as_str(),
                    worker.pid,
                    worker.status.as_str(),
                    worker.specialization,
                    worker.shard,
                    worker.model.as_ref().map(|m| m.as_str().to_string()),
                    worker.started_at,
                    worker.last_heartbeat,
                    worker.tasks_completed,
                    worker.tasks_failed,
                    worker.crash_count,
                    worker.current_task.as_ref().map(|t| t.as_str().to_string()),
                ],
            )?;
            insert_event_conn(
                tx,
                &NewEvent {
                    aggregate_type: "worker".into(),
                    aggregate_id: worker.id.as_str().into(),
                    kind: EventKind::WorkerRegistered,
                    payload: serde_json::json!({ "pid": worker.pid }),
                    trace_id: trace.clone(),
                    causation_id: None,
                    correlation_id: None,
                },
                worker.started_at,
            )?;
            Ok(())
        })?;
        info!(worker = %worker.id, pid = worker.pid, "worker registered");
        Ok(())
    }

    /// Heartbeat: bump `last_heartbeat`, record the current task, append to
    /// the heartbeat history table.
    pub fn heartbeat_worker(
        &self,
        id: &WorkerId,
        current_task: Option<&TaskId>,
        status: WorkerStatus,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE workers SET last_heartbeat = ?1, status = ?2, current_task = ?3 WHERE id = ?4",
                params![
                    now,
                    status.as_str(),
                    current_task.map(|t| t.as_str().to_string()),
                    id.as_str()
                ],
            )?;
            conn.execute(
                "INSERT INTO worker_heartbeats (worker_id, ts) VALUES (?1, ?2)",
                params![id.as_str(), now],
            )?;
            Ok(())
        })
    }

    pub fn set_worker_status(&self, id: &WorkerId, status: WorkerStatus) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE workers SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn get_worker(&self, id: &WorkerId) -> Result<Option<Worker>, TriadError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                params![id.as_str()],
                row_to_worker,
            )
            .optional()
        })
    }

    pub fn list_workers(&self) -> Result<Vec<Worker>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_worker)?;
            rows.collect()
        })
    }

    /// Busy workers whose heartbeat is older than `threshold_secs`.
    pub fn stale_workers(&self, now: Timestamp, threshold_secs: i64) -> Result<Vec<Worker>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WORKER_COLUMNS} FROM workers \
                 WHERE status = 'busy' AND last_heartbeat <= ?1"
            ))?;
            let rows = stmt.query_map(params![now - threshold_secs], row_to_worker)?;
            rows.collect()
        })
    }

    /// Mark a worker dead and emit the audit event.
    pub fn mark_worker_dead(&self, id: &WorkerId, trace: &TraceId, now: Timestamp) -> Result<(), TriadError> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "UPDATE workers SET status = 'dead', current_task = NULL WHERE id = ?1",
                params![id.as_str()],
            )?;
            insert_event_conn(
                tx,
                &NewEvent {
                    aggregate_type: "worker".into(),
                    aggregate_id: id.as_str().into(),
                    kind: EventKind::WorkerDead,
                    payload: serde_json::Value::Null,
                    trace_id: trace.clone(),
                    causation_id: None,
                    correlation_id: None,
                },
                now,
            )?;
            Ok(())
        })
    }

    pub fn bump_worker_completed(&self, id: &WorkerId) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE workers SET tasks_completed = tasks_completed + 1 WHERE id = ?1",
                params![id.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn bump_worker_failed(&self, id: &WorkerId) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE workers SET tasks_failed = tasks_failed + 1 WHERE id = ?1",
                params![id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Count of workers in active statuses.
    pub fn active_worker_count(&self) -> Result<u64, TriadError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM workers WHERE status IN ('starting', 'idle', 'busy')",
                [],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as u64)
    }
}

fn row_to_worker(row: &rusqlite::Row<'_>) -> rusqlite::Result<Worker> {
    let status_raw: String = row.get(2)?;
    Ok(Worker {
        id: WorkerId::new(row.get::<_, String>(0)?),
        pid: row.get(1)?,
        status: WorkerStatus::parse(&status_raw).unwrap_or(WorkerStatus::Crashed),
        specialization: row.get(3)?,
        shard: row.get(4)?,
        model: row.get::<_, Option<String>>(5)?.map(ModelId::new),
        started_at: row.get(6)?,
        last_heartbeat: row.get(7)?,
        tasks_completed: row.get::<_, i64>(8)? as u64,
        tasks_failed: row.get::<_, i64>(9)? as u64,
        crash_count: row.get(10)?,
        current_task: row.get::<_, Option<String>>(11)?.map(TaskId::from_string),
    })
}
