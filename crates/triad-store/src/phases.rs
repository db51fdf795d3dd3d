//! Phase, artifact, and gate rows. The phase vocabulary and ordering rules
//! live in triad-phases; the store treats phase names as opaque strings.

use rusqlite::{params, OptionalExtension};

use triad_core::event::{EventKind, NewEvent};
use triad_core::types::{GateStatus, TaskId, Timestamp, TraceId};
use triad_core::TriadError;

use crate::db::Store;
use crate::events::insert_event_conn;

/// One (task, phase) row.
#[derive(Debug, Clone)]
pub struct PhaseRow {
    pub task_id: TaskId,
    pub phase: String,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub gate_status: GateStatus,
    pub gate_failures: Option<String>,
    pub gate_approvers: Option<String>,
}

impl Store {
    pub fn start_phase_row(
        &self,
        task_id: &TaskId,
        phase: &str,
        trace: &TraceId,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT INTO task_phases (task_id, phase, started_at, gate_status) \
                 VALUES (?1, ?2, ?3, 'PENDING') \
                 ON CONFLICT (task_id, phase) DO UPDATE SET started_at = excluded.started_at, \
                 completed_at = NULL",
                params![task_id.as_str(), phase, now],
            )?;
            insert_event_conn(
                tx,
                &NewEvent::task(task_id.as_str(), EventKind::PhaseStarted, trace.clone())
                    .with_payload(serde_json::json!({ "phase": phase })),
                now,
            )?;
            Ok(())
        })
    }

    pub fn complete_phase_row(
        &self,
        task_id: &TaskId,
        phase: &str,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE task_phases SET completed_at = ?1 WHERE task_id = ?2 AND phase = ?3",
                params![now, task_id.as_str(), phase],
            )?;
            Ok(())
        })
    }

    pub fn get_phase_row(&self, task_id: &TaskId, phase: &str) -> Result<Option<PhaseRow>, TriadError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT task_id, phase, started_at, completed_at, gate_status, gate_failures, \
                 gate_approvers FROM task_phases WHERE task_id = ?1 AND phase = ?2",
                params![task_id.as_str(), phase],
                row_to_phase,
            )
            .optional()
        })
    }

    /// The most recently started phase for a task, if any.
    pub fn latest_phase_row(&self, task_id: &TaskId) -> Result<Option<PhaseRow>, TriadError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT task_id, phase, started_at, completed_at, gate_status, gate_failures, \
                 gate_approvers FROM task_phases WHERE task_id = ?1 \
                 ORDER BY started_at DESC, rowid DESC LIMIT 1",
                params![task_id.as_str()],
                row_to_phase,
            )
            .optional()
        })
    }

    pub fn record_artifact(
        &self,
        task_id: &TaskId,
        phase: &str,
        name: &str,
        path: Option<&str>,
        trace: &TraceId,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "INSERT INTO phase_artifacts (task_id, phase, name, path, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (task_id, phase, name) DO UPDATE SET path = excluded.path, \
                 recorded_at = excluded.recorded_at",
                params![task_id.as_str(), phase, name, path, now],
            )?;
            insert_event_conn(
                tx,
                &NewEvent::task(task_id.as_str(), EventKind::ArtifactRecorded, trace.clone())
                    .with_payload(serde_json::json!({ "phase": phase, "artifact": name })),
                now,
            )?;
            Ok(())
        })
    }

    pub fn artifacts_for_phase(&self, task_id: &TaskId, phase: &str) -> Result<Vec<String>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM phase_artifacts WHERE task_id = ?1 AND phase = ?2 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![task_id.as_str(), phase], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Set the gate outcome on the phase row and mirror it into `gates`.
    #[allow(clippy::too_many_arguments)]
    pub fn set_gate_status(
        &self,
        task_id: &TaskId,
        phase: &str,
        status: GateStatus,
        failures: Option<&str>,
        approvers: Option<&str>,
        request_id: Option<&str>,
        approvals: u32,
        rejections: u32,
        trace: &TraceId,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "UPDATE task_phases SET gate_status = ?1, gate_failures = ?2, gate_approvers = ?3 \
                 WHERE task_id = ?4 AND phase = ?5",
                params![status.as_str(), failures, approvers, task_id.as_str(), phase],
            )?;
            tx.execute(
                "INSERT INTO gates (task_id, phase, status, approvals, rejections, request_id, decided_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (task_id, phase) DO UPDATE SET status = excluded.status, \
                 approvals = excluded.approvals, rejections = excluded.rejections, \
                 request_id = excluded.request_id, decided_at = excluded.decided_at",
                params![task_id.as_str(), phase, status.as_str(), approvals, rejections, request_id, now],
            )?;
            let kind = if status == GateStatus::Passed {
                EventKind::GatePassed
            } else {
                EventKind::GateFailed
            };
            insert_event_conn(
                tx,
                &NewEvent::task(task_id.as_str(), kind, trace.clone()).with_payload(
                    serde_json::json!({
                        "phase": phase,
                        "status": status.as_str(),
                        "approvals": approvals,
                        "rejections": rejections,
                    }),
                ),
                now,
            )?;
            Ok(())
        })
    }

    pub fn record_gate_decision(
        &self,
        task_id: &TaskId,
        phase: &str,
        request_id: &str,
        decision: &str,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO phase_gate_decisions (task_id, phase, request_id, decision, decided_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![task_id.as_str(), phase, request_id, decision, now],
            )?;
            Ok(())
        })
    }
}

fn row_to_phase(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhaseRow> {
    let gate_raw: String = row.get(4)?;
    Ok(PhaseRow {
        task_id: TaskId::from_string(row.get::<_, String>(0)?),
        phase: row.get(1)?,
        started_at: row.get(2)?,
        completed_at: row.get(3)?,
        gate_status: GateStatus::parse(&gate_raw).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("bad gate status {gate_raw}").into(),
            )
        })?,
        gate_failures: row.get(5)?,
        gate_approvers: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_rows_and_artifacts_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let task = TaskId::from_string("task-1");
        let trace = TraceId::generate();

        store.start_phase_row(&task, "DOCUMENT", &trace, 100).unwrap();
        store
            .record_artifact(&task, "DOCUMENT", "spec.md", Some("/tmp/spec.md"), &trace, 110)
            .unwrap();
        store
            .record_artifact(&task, "DOCUMENT", "acceptance_criteria.md", None, &trace, 111)
            .unwrap();

        let row = store.get_phase_row(&task, "DOCUMENT").unwrap().unwrap();
        assert_eq!(row.gate_status, GateStatus::Pending);
        assert_eq!(
            store.artifacts_for_phase(&task, "DOCUMENT").unwrap(),
            vec!["acceptance_criteria.md", "spec.md"]
        );
    }

    #[test]
    fn gate_status_updates_phase_and_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let task = TaskId::from_string("task-1");
        let trace = TraceId::generate();

        store.start_phase_row(&task, "PLAN", &trace, 100).unwrap();
        store
            .set_gate_status(
                &task, "PLAN", GateStatus::Passed, None, Some("claude,codex"),
                Some("review-1"), 2, 0, &trace, 200,
            )
            .unwrap();

        let row = store.get_phase_row(&task, "PLAN").unwrap().unwrap();
        assert_eq!(row.gate_status, GateStatus::Passed);
        assert_eq!(row.gate_approvers.as_deref(), Some("claude,codex"));
    }

    #[test]
    fn latest_phase_tracks_most_recent_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let task = TaskId::from_string("task-1");
        let trace = TraceId::generate();

        store.start_phase_row(&task, "BRAINSTORM", &trace, 100).unwrap();
        store.start_phase_row(&task, "DOCUMENT", &trace, 200).unwrap();
        let latest = store.latest_phase_row(&task).unwrap().unwrap();
        assert_eq!(latest.phase, "DOCUMENT");
    }
}
