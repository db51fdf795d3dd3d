//! Task persistence and the durable state machine.
//!
//! Two operations carry the concurrency weight of the whole kernel:
//!
//! * `transition_task` — a conditional `UPDATE … WHERE id = ? AND state = ?`
//!   inside BEGIN IMMEDIATE. Zero rows changed means another process moved
//!   the task first; the caller sees `TransitionConflict` and retries from a
//!   fresh read. Two transitions with the same "from" can never both win.
//! * `claim_task` — `UPDATE … WHERE id = (SELECT … LIMIT 1) AND state =
//!   'QUEUED' RETURNING id`, which hands each QUEUED task to exactly one
//!   worker across processes.

use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use triad_core::event::{EventKind, NewEvent};
use triad_core::task::Task;
use triad_core::types::{
    ModelId, Priority, TaskId, TaskState, Timestamp, TraceId, WorkerId,
};
use triad_core::TriadError;

use crate::db::Store;
use crate::events::insert_event_conn;

const TASK_COLUMNS: &str = "id, name, task_type, priority, state, lane, shard, assigned_model, \
     worker_id, created_at, updated_at, started_at, completed_at, retry_count, max_retries, \
     parent_task_id, payload, result, error, error_class, priority_changed_at, trace_id, \
     heartbeat_at, last_activity_at, checksum, checkpoint";

/// Filters for `claim_task`. All optional; an empty filter claims the oldest
/// task in the highest non-empty lane.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub task_types: Vec<String>,
    pub shard: Option<String>,
    pub model: Option<ModelId>,
}

impl Store {
    // ── Submission ───────────────────────────────────────────────────────────

    /// Insert a fresh task and its TASK_CREATED event atomically.
    pub fn insert_task(&self, task: &Task) -> Result<(), TriadError> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT INTO tasks (id, name, task_type, priority, state, lane, shard, \
                 assigned_model, worker_id, created_at, updated_at, started_at, completed_at, \
                 retry_count, max_retries, parent_task_id, payload, result, error, error_class, \
                 priority_changed_at, trace_id, heartbeat_at, last_activity_at, checksum, checkpoint) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                 ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
                params![
                    task.id.as_str(),
                    task.name,
                    task.task_type,
                    task.priority.as_i64(),
                    task.state.as_str(),
                    task.lane,
                    task.shard,
                    task.assigned_model.as_ref().map(|m| m.as_str().to_string()),
                    task.worker_id.as_ref().map(|w| w.as_str().to_string()),
                    task.created_at,
                    task.updated_at,
                    task.started_at,
                    task.completed_at,
                    task.retry_count,
                    task.max_retries,
                    task.parent_task_id.as_ref().map(|p| p.as_str().to_string()),
                    task.payload,
                    task.result,
                    task.error,
                    Option::<String>::None,
                    task.created_at,
                    task.trace_id.as_str(),
                    task.heartbeat_at,
                    task.last_activity_at,
                    task.checksum,
                    task.checkpoint,
                ],
            )?;
            insert_event_conn(
                tx,
                &NewEvent::task(task.id.as_str(), EventKind::TaskCreated, task.trace_id.clone())
                    .with_payload(serde_json::json!({
                        "name": task.name,
                        "type": task.task_type,
                        "priority": task.priority.as_str(),
                    })),
                task.created_at,
            )?;
            Ok(())
        })?;
        info!(task_id = %task.id, priority = %task.priority, "task queued");
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn get_task(&self, id: &TaskId) -> Result<Task, TriadError> {
        self.find_task(id)?
            .ok_or_else(|| TriadError::TaskNotFound(id.to_string()))
    }

    pub fn find_task(&self, id: &TaskId) -> Result<Option<Task>, TriadError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.as_str()],
                row_to_task,
            )
            .optional()
        })
    }

    pub fn tasks_in_state(&self, state: TaskState) -> Result<Vec<Task>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE state = ?1 ORDER BY priority ASC, created_at ASC"
            ))?;
            let rows = stmt.query_map(params![state.as_str()], row_to_task)?;
            rows.collect()
        })
    }

    pub fn count_in_state(&self, state: TaskState) -> Result<u64, TriadError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE state = ?1",
                params![state.as_str()],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as u64)
    }

    pub fn queue_depth(&self) -> Result<u64, TriadError> {
        self.count_in_state(TaskState::Queued)
    }

    /// RUNNING tasks whose run began at or before `cutoff` (stuck candidates).
    pub fn running_started_before(&self, cutoff: Timestamp) -> Result<Vec<Task>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE state = 'RUNNING' AND started_at <= ?1"
            ))?;
            let rows = stmt.query_map(params![cutoff], row_to_task)?;
            rows.collect()
        })
    }

    /// RUNNING tasks owned by `worker`.
    pub fn running_tasks_for_worker(&self, worker: &WorkerId) -> Result<Vec<Task>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE state = 'RUNNING' AND worker_id = ?1"
            ))?;
            let rows = stmt.query_map(params![worker.as_str()], row_to_task)?;
            rows.collect()
        })
    }

    /// FAILED tasks with retries remaining and a retryable error class.
    pub fn failed_retryable(&self) -> Result<Vec<Task>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE state = 'FAILED' \
                 AND retry_count < max_retries AND error_class IN ('transient', 'stale')"
            ))?;
            let rows = stmt.query_map([], row_to_task)?;
            rows.collect()
        })
    }

    /// The lowest-priority currently RUNNING task (preemption victim probe).
    pub fn lowest_priority_running(&self) -> Result<Option<Task>, TriadError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE state = 'RUNNING' \
                     ORDER BY priority DESC, started_at DESC LIMIT 1"
                ),
                [],
                row_to_task,
            )
            .optional()
        })
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    /// Move `id` to `new_state`, enforcing the legal-transition matrix and
    /// linearizability per task id. `reason` and `actor` land in the event.
    pub fn transition_task(
        &self,
        id: &TaskId,
        new_state: TaskState,
        reason: &str,
        actor: &str,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        let task = self.get_task(id)?;
        let from = task.state;

        if !from.can_transition_to(new_state) {
            return Err(TriadError::InvalidTransition {
                from: from.as_str().into(),
                to: new_state.as_str().into(),
            });
        }

        let trace = task.trace_id.clone();
        let changed = self.with_immediate_tx(|tx| {
            let changed = apply_transition(tx, id, from, new_state, now)?;
            if changed {
                insert_event_conn(
                    tx,
                    &NewEvent::task(id.as_str(), EventKind::StateChanged, trace.clone())
                        .with_payload(serde_json::json!({
                            "from": from.as_str(),
                            "to": new_state.as_str(),
                            "reason": reason,
                            "actor": actor,
                        })),
                    now,
                )?;
            }
            Ok(changed)
        })?;

        if !changed {
            return Err(TriadError::TransitionConflict {
                task_id: id.to_string(),
            });
        }
        debug!(task_id = %id, from = %from, to = %new_state, reason, "transition");
        Ok(())
    }

    /// Claim the oldest QUEUED task in the highest non-empty lane matching
    /// `filter`. Returns `None` when the queue is empty for the filter or the
    /// system is paused. At-most-one caller receives any given task.
    pub fn claim_task(
        &self,
        worker: &WorkerId,
        filter: &ClaimFilter,
        now: Timestamp,
    ) -> Result<Option<Task>, TriadError> {
        if self.is_paused()? {
            return Ok(None);
        }

        let mut select = String::from("SELECT id FROM tasks WHERE state = 'QUEUED'");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if !filter.task_types.is_empty() {
            let placeholders = filter
                .task_types
                .iter()
                .map(|_| "?")
                .collect::<Vec<_>>()
                .join(", ");
            select.push_str(&format!(" AND task_type IN ({placeholders})"));
            for t in &filter.task_types {
                args.push(Box::new(t.clone()));
            }
        }
        if let Some(shard) = &filter.shard {
            select.push_str(" AND (shard IS NULL OR shard = ?)");
            args.push(Box::new(shard.clone()));
        }
        if let Some(model) = &filter.model {
            select.push_str(" AND (assigned_model IS NULL OR assigned_model = ?)");
            args.push(Box::new(model.as_str().to_string()));
        }
        select.push_str(" ORDER BY priority ASC, created_at ASC LIMIT 1");

        let sql = format!(
            "UPDATE tasks SET state = 'RUNNING', worker_id = ?, started_at = ?, updated_at = ?, \
             heartbeat_at = ?, last_activity_at = ? \
             WHERE id = ({select}) AND state = 'QUEUED' RETURNING id, trace_id"
        );

        let worker_name = worker.as_str().to_string();
        let claimed: Option<String> = self.with_immediate_tx(|tx| {
            let mut all_args: Vec<&dyn ToSql> =
                vec![&worker_name, &now, &now, &now, &now];
            for a in &args {
                all_args.push(a.as_ref());
            }
            let claimed: Option<(String, String)> = tx
                .query_row(&sql, all_args.as_slice(), |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?;
            if let Some((id, trace)) = &claimed {
                insert_event_conn(
                    tx,
                    &NewEvent::task(id.clone(), EventKind::TaskClaimed, TraceId(trace.clone()))
                        .with_payload(serde_json::json!({ "worker": worker_name })),
                    now,
                )?;
            }
            Ok(claimed.map(|(id, _)| id))
        })?;

        match claimed {
            Some(id) => {
                let task = self.get_task(&TaskId::from_string(id))?;
                info!(task_id = %task.id, worker = %worker, "task claimed");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Record a failure: transition to FAILED with the error attached, then
    /// requeue or escalate. Non-retryable classes are never re-queued.
    pub fn mark_task_failed(
        &self,
        id: &TaskId,
        error: &TriadError,
        actor: &str,
        now: Timestamp,
    ) -> Result<TaskState, TriadError> {
        let class = error.class();
        let detail = error.to_string();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET error = ?1, error_class = ?2 WHERE id = ?3",
                params![detail, class_name(class), id.as_str()],
            )?;
            Ok(())
        })?;
        self.transition_task(id, TaskState::Failed, &detail, actor, now)?;

        if !class.is_retryable() {
            self.transition_task(id, TaskState::Escalated, "non-retryable error", actor, now)?;
            return Ok(TaskState::Escalated);
        }
        self.requeue_or_escalate(id, &detail, actor, now)
    }

    /// From REJECTED / TIMEOUT / FAILED: retry_count += 1, then back to
    /// QUEUED while retries remain, otherwise ESCALATED.
    pub fn requeue_or_escalate(
        &self,
        id: &TaskId,
        reason: &str,
        actor: &str,
        now: Timestamp,
    ) -> Result<TaskState, TriadError> {
        let task = self.get_task(id)?;
        let next_retry = task.retry_count + 1;

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET retry_count = ?1, updated_at = ?2 WHERE id = ?3",
                params![next_retry, now, id.as_str()],
            )?;
            Ok(())
        })?;

        if next_retry >= task.max_retries {
            self.transition_task(id, TaskState::Escalated, "retry budget exhausted", actor, now)?;
            info!(task_id = %id, retries = next_retry, "escalated");
            Ok(TaskState::Escalated)
        } else {
            self.transition_task(id, TaskState::Queued, reason, actor, now)?;
            Ok(TaskState::Queued)
        }
    }

    /// Store the structured result for a task (decision, tallies, phase trail).
    pub fn record_result(&self, id: &TaskId, result: &str, now: Timestamp) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET result = ?1, updated_at = ?2 WHERE id = ?3",
                params![result, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn set_checkpoint(&self, id: &TaskId, checkpoint_json: &str, now: Timestamp) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET checkpoint = ?1, updated_at = ?2 WHERE id = ?3",
                params![checkpoint_json, now, id.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn heartbeat_task(&self, id: &TaskId, now: Timestamp) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET heartbeat_at = ?1, last_activity_at = ?1 WHERE id = ?2",
                params![now, id.as_str()],
            )?;
            Ok(())
        })
    }

    // ── Escalation ───────────────────────────────────────────────────────────

    /// Promote QUEUED tasks that have waited in their lane past the lane's
    /// threshold. Highest lanes first so one tick promotes one step.
    /// Returns (task, new priority) per promotion.
    pub fn escalate_waiting(
        &self,
        low_after: i64,
        medium_after: i64,
        high_after: i64,
        now: Timestamp,
    ) -> Result<Vec<(TaskId, Priority)>, TriadError> {
        let lanes = [
            (Priority::High, high_after),
            (Priority::Medium, medium_after),
            (Priority::Low, low_after),
        ];
        let mut promoted = Vec::new();

        for (lane, threshold) in lanes {
            let target = lane.promoted().expect("non-critical lane promotes");
            let ids: Vec<(String, String)> = self.with_immediate_tx(|tx| {
                let mut stmt = tx.prepare(
                    "SELECT id, trace_id FROM tasks WHERE state = 'QUEUED' AND priority = ?1 \
                     AND priority_changed_at <= ?2",
                )?;
                let rows: Vec<(String, String)> = stmt
                    .query_map(params![lane.as_i64(), now - threshold], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<rusqlite::Result<_>>()?;
                drop(stmt);

                for (id, trace) in &rows {
                    tx.execute(
                        "UPDATE tasks SET priority = ?1, priority_changed_at = ?2, updated_at = ?2 \
                         WHERE id = ?3 AND state = 'QUEUED' AND priority = ?4",
                        params![target.as_i64(), now, id, lane.as_i64()],
                    )?;
                    insert_event_conn(
                        tx,
                        &NewEvent::task(id.clone(), EventKind::PriorityEscalated, TraceId(trace.clone()))
                            .with_payload(serde_json::json!({
                                "from": lane.as_str(),
                                "to": target.as_str(),
                                "waited_s": threshold,
                            })),
                        now,
                    )?;
                }
                Ok(rows)
            })?;

            for (id, _) in ids {
                info!(task_id = %id, from = %lane, to = %target, "priority escalated");
                promoted.push((TaskId::from_string(id), target));
            }
        }
        Ok(promoted)
    }
}

/// The conditional UPDATE that makes transitions linearizable. Returns true
/// iff this caller won the race.
fn apply_transition(
    conn: &Connection,
    id: &TaskId,
    from: TaskState,
    to: TaskState,
    now: Timestamp,
) -> rusqlite::Result<bool> {
    // Leaving RUNNING releases the worker slot; entering a terminal state
    // stamps completion; entering RUNNING stamps the start.
    let sql = match to {
        TaskState::Running => {
            "UPDATE tasks SET state = ?1, updated_at = ?2, last_activity_at = ?2, \
             started_at = ?2 WHERE id = ?3 AND state = ?4"
        }
        TaskState::Completed | TaskState::Cancelled | TaskState::Escalated => {
            "UPDATE tasks SET state = ?1, updated_at = ?2, last_activity_at = ?2, \
             completed_at = ?2, worker_id = NULL WHERE id = ?3 AND state = ?4"
        }
        _ if from == TaskState::Running => {
            "UPDATE tasks SET state = ?1, updated_at = ?2, last_activity_at = ?2, \
             worker_id = NULL WHERE id = ?3 AND state = ?4"
        }
        _ => {
            "UPDATE tasks SET state = ?1, updated_at = ?2, last_activity_at = ?2 \
             WHERE id = ?3 AND state = ?4"
        }
    };
    let changed = conn.execute(
        sql,
        params![to.as_str(), now, id.as_str(), from.as_str()],
    )?;
    Ok(changed > 0)
}

fn class_name(class: triad_core::error::ErrorClass) -> &'static str {
    use triad_core::error::ErrorClass::*;
    match class {
        Transient => "transient",
        NonRetryable => "non_retryable",
        Quota => "quota",
        Schema => "schema",
        Integrity => "integrity",
        Stale => "stale",
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let priority_raw: i64 = row.get(3)?;
    let state_raw: String = row.get(4)?;
    Ok(Task {
        id: TaskId::from_string(row.get::<_, String>(0)?),
        name: row.get(1)?,
        task_type: row.get(2)?,
        priority: Priority::from_i64(priority_raw).unwrap_or(Priority::Low),
        state: TaskState::parse(&state_raw).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("bad state {state_raw}").into(),
            )
        })?,
        lane: row.get(5)?,
        shard: row.get(6)?,
        assigned_model: row.get::<_, Option<String>>(7)?.map(ModelId::new),
        worker_id: row.get::<_, Option<String>>(8)?.map(WorkerId::new),
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        started_at: row.get(11)?,
        completed_at: row.get(12)?,
        retry_count: row.get(13)?,
        max_retries: row.get(14)?,
        parent_task_id: row.get::<_, Option<String>>(15)?.map(TaskId::from_string),
        payload: row.get(16)?,
        result: row.get(17)?,
        error: row.get(18)?,
        trace_id: TraceId(row.get(21)?),
        heartbeat_at: row.get(22)?,
        last_activity_at: row.get(23)?,
        checksum: row.get(24)?,
        checkpoint: row.get(25)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use triad_core::task::NewTask;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    fn queue(store: &Store, name: &str, priority: Priority, now: Timestamp) -> TaskId {
        let task = NewTask::new(name, "IMPLEMENTATION", priority, format!("payload for {name}"))
            .into_task(now, TraceId::generate());
        let id = task.id.clone();
        store.insert_task(&task).unwrap();
        id
    }

    #[test]
    fn claim_is_fifo_within_lane() {
        let (_dir, store) = store();
        let t1 = queue(&store, "first", Priority::High, 100);
        let t2 = queue(&store, "second", Priority::High, 101);
        let t3 = queue(&store, "third", Priority::High, 102);

        let w = WorkerId::new("worker-1-1");
        for expected in [t1, t2, t3] {
            let claimed = store.claim_task(&w, &ClaimFilter::default(), 200).unwrap().unwrap();
            assert_eq!(claimed.id, expected);
            // Put it out of the way so the next claim sees the next task.
            store
                .transition_task(&claimed.id, TaskState::Completed, "done", "test", 201)
                .unwrap();
        }
    }

    #[test]
    fn critical_dominates_earlier_low() {
        let (_dir, store) = store();
        let low = queue(&store, "low", Priority::Low, 100);
        let critical = queue(&store, "critical", Priority::Critical, 200);

        let w = WorkerId::new("worker-1-1");
        let first = store.claim_task(&w, &ClaimFilter::default(), 300).unwrap().unwrap();
        assert_eq!(first.id, critical);
        store
            .transition_task(&first.id, TaskState::Completed, "done", "test", 301)
            .unwrap();
        let second = store.claim_task(&w, &ClaimFilter::default(), 302).unwrap().unwrap();
        assert_eq!(second.id, low);
    }

    #[test]
    fn at_most_one_concurrent_claim_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let id = queue(&store, "contested", Priority::High, 100);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let w = WorkerId::new(format!("worker-{i}-1"));
                store
                    .claim_task(&w, &ClaimFilter::default(), 200)
                    .unwrap()
                    .map(|t| t.id)
            }));
        }
        let winners: Vec<TaskId> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(winners, vec![id]);
    }

    #[test]
    fn transition_requires_matrix_edge_and_current_state() {
        let (_dir, store) = store();
        let id = queue(&store, "t", Priority::Medium, 100);

        // QUEUED -> COMPLETED is not an edge.
        assert!(matches!(
            store.transition_task(&id, TaskState::Completed, "", "test", 101),
            Err(TriadError::InvalidTransition { .. })
        ));

        // Claim, then the legal chain works.
        let w = WorkerId::new("worker-1-1");
        store.claim_task(&w, &ClaimFilter::default(), 102).unwrap().unwrap();
        store.transition_task(&id, TaskState::Review, "phase done", "test", 103).unwrap();
        store.transition_task(&id, TaskState::Approved, "consensus", "test", 104).unwrap();
        store.transition_task(&id, TaskState::Completed, "", "test", 105).unwrap();
        assert!(store.get_task(&id).unwrap().state.is_terminal());
    }

    #[test]
    fn leaving_running_releases_worker() {
        let (_dir, store) = store();
        let id = queue(&store, "t", Priority::High, 100);
        let w = WorkerId::new("worker-1-1");
        store.claim_task(&w, &ClaimFilter::default(), 101).unwrap().unwrap();
        assert!(store.get_task(&id).unwrap().worker_id.is_some());

        store.transition_task(&id, TaskState::Review, "", "test", 102).unwrap();
        assert!(store.get_task(&id).unwrap().worker_id.is_none());
    }

    #[test]
    fn paused_store_claims_nothing() {
        let (_dir, store) = store();
        queue(&store, "t", Priority::Critical, 100);
        store.set_paused("operator").unwrap();
        let w = WorkerId::new("worker-1-1");
        assert!(store.claim_task(&w, &ClaimFilter::default(), 101).unwrap().is_none());
        store.clear_paused().unwrap();
        assert!(store.claim_task(&w, &ClaimFilter::default(), 102).unwrap().is_some());
    }

    #[test]
    fn claim_honors_type_shard_and_model_filters() {
        let (_dir, store) = store();
        let mut t = NewTask::new("typed", "SECURITY_SCAN", Priority::High, "scan");
        t.shard = Some("eu".into());
        t.assigned_model = Some(ModelId::new("codex"));
        let task = t.into_task(100, TraceId::generate());
        let id = task.id.clone();
        store.insert_task(&task).unwrap();

        let w = WorkerId::new("worker-1-1");
        let wrong_type = ClaimFilter {
            task_types: vec!["IMPLEMENTATION".into()],
            ..Default::default()
        };
        assert!(store.claim_task(&w, &wrong_type, 101).unwrap().is_none());

        let wrong_model = ClaimFilter {
            model: Some(ModelId::new("gemini")),
            ..Default::default()
        };
        assert!(store.claim_task(&w, &wrong_model, 102).unwrap().is_none());

        let matching = ClaimFilter {
            task_types: vec!["SECURITY_SCAN".into()],
            shard: Some("eu".into()),
            model: Some(ModelId::new("codex")),
        };
        assert_eq!(store.claim_task(&w, &matching, 103).unwrap().unwrap().id, id);
    }

    #[test]
    fn requeue_escalates_past_retry_cap() {
        let (_dir, store) = store();
        let mut nt = NewTask::new("flaky", "IMPLEMENTATION", Priority::High, "x");
        nt.max_retries = Some(2);
        let task = nt.into_task(100, TraceId::generate());
        let id = task.id.clone();
        store.insert_task(&task).unwrap();

        let w = WorkerId::new("worker-1-1");
        // Attempt 1: fails transiently, requeues with retry_count = 1.
        store.claim_task(&w, &ClaimFilter::default(), 101).unwrap().unwrap();
        let err = TriadError::Transport { model: "codex".into(), detail: "reset".into() };
        assert_eq!(store.mark_task_failed(&id, &err, "test", 102).unwrap(), TaskState::Queued);
        assert_eq!(store.get_task(&id).unwrap().retry_count, 1);

        // Attempt 2: hits the cap and escalates.
        store.claim_task(&w, &ClaimFilter::default(), 103).unwrap().unwrap();
        assert_eq!(
            store.mark_task_failed(&id, &err, "test", 104).unwrap(),
            TaskState::Escalated
        );
    }

    #[test]
    fn non_retryable_failure_escalates_immediately() {
        let (_dir, store) = store();
        let id = queue(&store, "bad-auth", Priority::High, 100);
        let w = WorkerId::new("worker-1-1");
        store.claim_task(&w, &ClaimFilter::default(), 101).unwrap().unwrap();

        let err = TriadError::Auth { model: "claude".into() };
        assert_eq!(
            store.mark_task_failed(&id, &err, "test", 102).unwrap(),
            TaskState::Escalated
        );
        assert_eq!(store.get_task(&id).unwrap().retry_count, 0);
    }

    #[test]
    fn escalation_promotes_one_lane_per_tick() {
        let (_dir, store) = store();
        let id = queue(&store, "aging", Priority::Low, 1_000);

        // After 3601s the LOW task becomes MEDIUM — and only MEDIUM.
        let promoted = store.escalate_waiting(3_600, 1_800, 900, 1_000 + 3_601).unwrap();
        assert_eq!(promoted, vec![(id.clone(), Priority::Medium)]);
        assert_eq!(store.get_task(&id).unwrap().priority, Priority::Medium);

        // Another 1801s: MEDIUM -> HIGH.
        let promoted = store
            .escalate_waiting(3_600, 1_800, 900, 1_000 + 3_601 + 1_801)
            .unwrap();
        assert_eq!(promoted, vec![(id.clone(), Priority::High)]);

        // Another 901s: HIGH -> CRITICAL.
        let promoted = store
            .escalate_waiting(3_600, 1_800, 900, 1_000 + 3_601 + 1_801 + 901)
            .unwrap();
        assert_eq!(promoted, vec![(id.clone(), Priority::Critical)]);

        // CRITICAL has nowhere to go.
        let promoted = store
            .escalate_waiting(3_600, 1_800, 900, 1_000 + 100_000)
            .unwrap();
        assert!(promoted.is_empty());
    }

    #[test]
    fn escalation_leaves_fresh_tasks_alone() {
        let (_dir, store) = store();
        let id = queue(&store, "fresh", Priority::Low, 1_000);
        let promoted = store.escalate_waiting(3_600, 1_800, 900, 1_000 + 3_599).unwrap();
        assert!(promoted.is_empty());
        assert_eq!(store.get_task(&id).unwrap().priority, Priority::Low);
    }
}
