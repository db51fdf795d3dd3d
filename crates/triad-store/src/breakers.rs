//! Mirror of breaker state into the `breakers` table.
//!
//! The key=value files under `breakers/` are authoritative (they must stay
//! readable even when the database is locked); this mirror exists so health
//! queries can join breaker state in SQL.

use rusqlite::params;

use triad_core::types::{BreakerState, ModelId, Timestamp};
use triad_core::TriadError;

use crate::db::Store;

#[derive(Debug, Clone)]
pub struct BreakerRow {
    pub model: ModelId,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure: Option<Timestamp>,
    pub last_success: Option<Timestamp>,
    pub half_open_calls: u32,
}

impl Store {
    pub fn upsert_breaker_row(&self, row: &BreakerRow, now: Timestamp) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO breakers (model, state, failure_count, last_failure, last_success, \
                 half_open_calls, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (model) DO UPDATE SET state = excluded.state, \
                 failure_count = excluded.failure_count, last_failure = excluded.last_failure, \
                 last_success = excluded.last_success, half_open_calls = excluded.half_open_calls, \
                 updated_at = excluded.updated_at",
                params![
                    row.model.as_str(),
                    row.state.as_str(),
                    row.failure_count,
                    row.last_failure,
                    row.last_success,
                    row.half_open_calls,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    pub fn breaker_rows(&self) -> Result<Vec<BreakerRow>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model, state, failure_count, last_failure, last_success, half_open_calls \
                 FROM breakers ORDER BY model",
            )?;
            let rows = stmt.query_map([], |row| {
                let state_raw: String = row.get(1)?;
                Ok(BreakerRow {
                    model: ModelId::new(row.get::<_, String>(0)?),
                    state: BreakerState::parse(&state_raw).map_err(|_| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            format!("bad breaker state {state_raw}").into(),
                        )
                    })?,
                    failure_count: row.get(2)?,
                    last_failure: row.get(3)?,
                    last_success: row.get(4)?,
                    half_open_calls: row.get(5)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Persist one health snapshot row (the JSON also lands in health.json).
    pub fn record_health(&self, status: &str, snapshot_json: &str, now: Timestamp) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO health_status (ts, status, snapshot) VALUES (?1, ?2, ?3)",
                params![now, status, snapshot_json],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_upsert_replaces_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut row = BreakerRow {
            model: ModelId::new("codex"),
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
            last_success: Some(100),
            half_open_calls: 0,
        };
        store.upsert_breaker_row(&row, 100).unwrap();

        row.state = BreakerState::Open;
        row.failure_count = 5;
        row.last_failure = Some(200);
        store.upsert_breaker_row(&row, 200).unwrap();

        let rows = store.breaker_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, BreakerState::Open);
        assert_eq!(rows[0].failure_count, 5);
    }
}
