//! The append-only event log. Records are never updated or deleted; `seq`
//! is assigned by SQLite and is monotonic.

use rusqlite::{params, Connection, OptionalExtension};

use triad_core::event::{Event, NewEvent};
use triad_core::types::{Timestamp, TraceId};
use triad_core::TriadError;

use crate::db::Store;

/// Insert an event using an existing connection/transaction. Store mutators
/// call this so the event lands atomically with the state change it records.
pub(crate) fn insert_event_conn(
    conn: &Connection,
    ev: &NewEvent,
    now: Timestamp,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO events (ts, aggregate_type, aggregate_id, event_type, payload, trace_id, causation_id, correlation_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            now,
            ev.aggregate_type,
            ev.aggregate_id,
            ev.kind.as_str(),
            ev.payload.to_string(),
            ev.trace_id.as_str(),
            ev.causation_id,
            ev.correlation_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Store {
    /// Append one event. Returns the assigned sequence id.
    pub fn append_event(&self, ev: &NewEvent, now: Timestamp) -> Result<i64, TriadError> {
        self.with_conn(|conn| insert_event_conn(conn, ev, now))
    }

    /// Read events strictly after `after_seq`, oldest first.
    pub fn events_after(&self, after_seq: i64, limit: u32) -> Result<Vec<Event>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, ts, aggregate_type, aggregate_id, event_type, payload, trace_id, causation_id, correlation_id \
                 FROM events WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![after_seq, limit], row_to_event)?;
            rows.collect()
        })
    }

    /// All events for one aggregate, oldest first.
    pub fn events_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<Event>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, ts, aggregate_type, aggregate_id, event_type, payload, trace_id, causation_id, correlation_id \
                 FROM events WHERE aggregate_type = ?1 AND aggregate_id = ?2 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![aggregate_type, aggregate_id], row_to_event)?;
            rows.collect()
        })
    }

    /// Highest assigned sequence id, if any events exist.
    pub fn latest_event_seq(&self) -> Result<Option<i64>, TriadError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT MAX(seq) FROM events", [], |row| row.get(0))
                .optional()
                .map(Option::flatten)
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let payload_text: String = row.get(5)?;
    Ok(Event {
        seq: row.get(0)?,
        ts: row.get(1)?,
        aggregate_type: row.get(2)?,
        aggregate_id: row.get(3)?,
        kind: row.get(4)?,
        payload: serde_json::from_str(&payload_text).unwrap_or(serde_json::Value::Null),
        trace_id: TraceId(row.get(6)?),
        causation_id: row.get(7)?,
        correlation_id: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use triad_core::event::EventKind;

    #[test]
    fn sequence_is_monotonic_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let trace = TraceId::generate();

        let s1 = store
            .append_event(&NewEvent::task("t1", EventKind::TaskCreated, trace.clone()), 100)
            .unwrap();
        let s2 = store
            .append_event(&NewEvent::task("t1", EventKind::StateChanged, trace.clone()), 101)
            .unwrap();
        assert!(s2 > s1);

        let events = store.events_after(0, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "TASK_CREATED");
        assert_eq!(events[1].kind, "STATE_CHANGED");

        let tail = store.events_after(s1, 10).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, s2);
    }
}
