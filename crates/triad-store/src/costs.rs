//! Cost rows. Dollar math lives in triad-breakers; the store only holds
//! token counts and answers per-day aggregation queries.

use rusqlite::params;

use triad_core::cost::CostRecord;
use triad_core::types::{ModelId, Timestamp};
use triad_core::TriadError;

use crate::db::Store;

/// Token totals for one model within one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayTokens {
    pub model: ModelId,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Store {
    pub fn record_cost(&self, rec: &CostRecord) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO costs (model, input_tokens, output_tokens, duration_ms, task_type, ts, trace_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rec.model.as_str(),
                    rec.input_tokens,
                    rec.output_tokens,
                    rec.duration_ms,
                    rec.task_type,
                    rec.ts,
                    rec.trace_id.as_str(),
                ],
            )?;
            Ok(())
        })
    }

    /// Per-model token totals for `[day_start, day_end)`.
    pub fn tokens_for_window(
        &self,
        day_start: Timestamp,
        day_end: Timestamp,
    ) -> Result<Vec<DayTokens>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model, COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0) \
                 FROM costs WHERE ts >= ?1 AND ts < ?2 GROUP BY model",
            )?;
            let rows = stmt.query_map(params![day_start, day_end], |row| {
                Ok(DayTokens {
                    model: ModelId::new(row.get::<_, String>(0)?),
                    input_tokens: row.get::<_, i64>(1)? as u64,
                    output_tokens: row.get::<_, i64>(2)? as u64,
                })
            })?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triad_core::types::TraceId;

    fn rec(model: &str, input: u64, output: u64, ts: Timestamp) -> CostRecord {
        CostRecord {
            model: ModelId::new(model),
            input_tokens: input,
            output_tokens: output,
            duration_ms: 900,
            task_type: "IMPLEMENTATION".into(),
            ts,
            trace_id: TraceId::generate(),
        }
    }

    #[test]
    fn window_aggregation_groups_by_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        store.record_cost(&rec("claude", 1_000, 500, 100)).unwrap();
        store.record_cost(&rec("claude", 2_000, 500, 200)).unwrap();
        store.record_cost(&rec("codex", 500, 100, 300)).unwrap();
        // Outside the window:
        store.record_cost(&rec("claude", 9_999, 9_999, 90_000)).unwrap();

        let mut totals = store.tokens_for_window(0, 1_000).unwrap();
        totals.sort_by(|a, b| a.model.cmp(&b.model));
        assert_eq!(
            totals,
            vec![
                DayTokens { model: ModelId::new("claude"), input_tokens: 3_000, output_tokens: 1_000 },
                DayTokens { model: ModelId::new("codex"), input_tokens: 500, output_tokens: 100 },
            ]
        );
    }
}
