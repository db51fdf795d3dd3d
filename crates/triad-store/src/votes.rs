//! Consensus request and vote persistence.
//!
//! Votes are idempotent per (request_id, model): the UNIQUE constraint plus
//! INSERT OR IGNORE means replaying a vote changes nothing, including the
//! tallies derived from the table.

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use triad_core::event::{EventKind, NewEvent};
use triad_core::review::{ConsensusRequest, Vote};
use triad_core::types::{
    Decision, ModelId, RequestId, RequestStatus, TaskId, Timestamp, TraceId,
};
use triad_core::TriadError;

use crate::db::Store;
use crate::events::insert_event_conn;

impl Store {
    pub fn create_consensus_request(&self, req: &ConsensusRequest) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO consensus_requests (id, task_id, review_type, subject, context, \
                 status, final_decision, approvals, rejections, abstentions, created_at, \
                 updated_at, timeout_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    req.id.as_str(),
                    req.task_id.as_str(),
                    req.review_type,
                    req.subject,
                    req.context,
                    req.status.as_str(),
                    req.final_decision.map(|d| d.as_str()),
                    req.approvals,
                    req.rejections,
                    req.abstentions,
                    req.created_at,
                    req.updated_at,
                    req.timeout_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_consensus_request(&self, id: &RequestId) -> Result<Option<ConsensusRequest>, TriadError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, task_id, review_type, subject, context, status, final_decision, \
                 approvals, rejections, abstentions, created_at, updated_at, timeout_at \
                 FROM consensus_requests WHERE id = ?1",
                params![id.as_str()],
                row_to_request,
            )
            .optional()
        })
    }

    /// Record one vote. Returns true if the vote was new, false if the
    /// (request_id, model) pair was already present.
    pub fn record_vote(&self, vote: &Vote, trace: &TraceId) -> Result<bool, TriadError> {
        let inserted = self.with_immediate_tx(|tx| {
            let changed = tx.execute(
                "INSERT OR IGNORE INTO consensus_votes (request_id, model, decision, confidence, \
                 reasoning, required_changes, latency_ms, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    vote.request_id.as_str(),
                    vote.model.as_str(),
                    vote.decision.as_str(),
                    vote.confidence,
                    vote.reasoning,
                    vote.required_changes
                        .as_ref()
                        .map(|c| serde_json::to_string(c).unwrap_or_default()),
                    vote.latency_ms,
                    vote.recorded_at,
                ],
            )?;
            if changed > 0 {
                insert_event_conn(
                    tx,
                    &NewEvent {
                        aggregate_type: "consensus".into(),
                        aggregate_id: vote.request_id.as_str().into(),
                        kind: EventKind::VoteRecorded,
                        payload: serde_json::json!({
                            "model": vote.model.as_str(),
                            "decision": vote.decision.as_str(),
                            "confidence": vote.confidence,
                        }),
                        trace_id: trace.clone(),
                        causation_id: None,
                        correlation_id: None,
                    },
                    vote.recorded_at,
                )?;
            }
            Ok(changed > 0)
        })?;
        if !inserted {
            debug!(request = %vote.request_id, model = %vote.model, "duplicate vote ignored");
        }
        Ok(inserted)
    }

    pub fn votes_for_request(&self, id: &RequestId) -> Result<Vec<Vote>, TriadError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT request_id, model, decision, confidence, reasoning, required_changes, \
                 latency_ms, recorded_at FROM consensus_votes WHERE request_id = ?1 ORDER BY model",
            )?;
            let rows = stmt.query_map(params![id.as_str()], row_to_vote)?;
            rows.collect()
        })
    }

    /// Finalize: write tallies, status, and final decision, and emit the
    /// CONSENSUS_FINALIZED event.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize_consensus_request(
        &self,
        id: &RequestId,
        status: RequestStatus,
        final_decision: Option<Decision>,
        approvals: u32,
        rejections: u32,
        abstentions: u32,
        trace: &TraceId,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        self.with_immediate_tx(|tx| {
            tx.execute(
                "UPDATE consensus_requests SET status = ?1, final_decision = ?2, approvals = ?3, \
                 rejections = ?4, abstentions = ?5, updated_at = ?6 WHERE id = ?7",
                params![
                    status.as_str(),
                    final_decision.map(|d| d.as_str()),
                    approvals,
                    rejections,
                    abstentions,
                    now,
                    id.as_str(),
                ],
            )?;
            insert_event_conn(
                tx,
                &NewEvent {
                    aggregate_type: "consensus".into(),
                    aggregate_id: id.as_str().into(),
                    kind: EventKind::ConsensusFinalized,
                    payload: serde_json::json!({
                        "status": status.as_str(),
                        "final_decision": final_decision.map(|d| d.as_str()),
                        "approvals": approvals,
                        "rejections": rejections,
                        "abstentions": abstentions,
                    }),
                    trace_id: trace.clone(),
                    causation_id: None,
                    correlation_id: None,
                },
                now,
            )?;
            Ok(())
        })
    }

    /// Audit row for which roster served a review.
    pub fn record_routing_decision(
        &self,
        task_id: &TaskId,
        review_type: &str,
        roster: &[ModelId],
        now: Timestamp,
    ) -> Result<(), TriadError> {
        let roster_json = serde_json::to_string(
            &roster.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
        )
        .map_err(|e| TriadError::Serialization(e.to_string()))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO routing_decisions (task_id, review_type, roster, decided_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![task_id.as_str(), review_type, roster_json, now],
            )?;
            Ok(())
        })
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConsensusRequest> {
    let status_raw: String = row.get(5)?;
    let decision_raw: Option<String> = row.get(6)?;
    Ok(ConsensusRequest {
        id: RequestId(row.get(0)?),
        task_id: TaskId::from_string(row.get::<_, String>(1)?),
        review_type: row.get(2)?,
        subject: row.get(3)?,
        context: row.get(4)?,
        status: RequestStatus::parse(&status_raw).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("bad status {status_raw}").into(),
            )
        })?,
        final_decision: decision_raw.and_then(|d| Decision::parse(&d).ok()),
        approvals: row.get(7)?,
        rejections: row.get(8)?,
        abstentions: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        timeout_at: row.get(12)?,
    })
}

fn row_to_vote(row: &rusqlite::Row<'_>) -> rusqlite::Result<Vote> {
    let decision_raw: String = row.get(2)?;
    let changes_raw: Option<String> = row.get(5)?;
    Ok(Vote {
        request_id: RequestId(row.get(0)?),
        model: ModelId::new(row.get::<_, String>(1)?),
        decision: Decision::parse(&decision_raw).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("bad decision {decision_raw}").into(),
            )
        })?,
        confidence: row.get(3)?,
        reasoning: row.get(4)?,
        required_changes: changes_raw.and_then(|c| serde_json::from_str(&c).ok()),
        latency_ms: row.get(6)?,
        recorded_at: row.get(7)?,
    })
}
