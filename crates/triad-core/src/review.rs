use serde::{Deserialize, Serialize};

use crate::types::{Decision, ModelId, RequestId, RequestStatus, TaskId, Timestamp};

// ── ConsensusRequest ─────────────────────────────────────────────────────────

/// One fan-out review: a subject, its context, and the running tallies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRequest {
    pub id: RequestId,
    pub task_id: TaskId,
    pub review_type: String,
    pub subject: String,
    pub context: String,
    pub status: RequestStatus,
    pub final_decision: Option<Decision>,
    pub approvals: u32,
    pub rejections: u32,
    pub abstentions: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub timeout_at: Timestamp,
}

// ── Vote ─────────────────────────────────────────────────────────────────────

/// One delegate's recorded vote. (request_id, model) is unique; re-inserting
/// the same pair leaves the tallies unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub request_id: RequestId,
    pub model: ModelId,
    pub decision: Decision,
    /// In [0, 1]; validated before the vote is constructed.
    pub confidence: f64,
    pub reasoning: String,
    pub required_changes: Option<Vec<String>>,
    pub latency_ms: Option<u64>,
    pub recorded_at: Timestamp,
}

impl Vote {
    /// The ABSTAIN bucket: malformed envelopes, timeouts, transport errors.
    /// `reason` is preserved for the audit trail.
    pub fn abstain(
        request_id: RequestId,
        model: ModelId,
        reason: impl Into<String>,
        recorded_at: Timestamp,
    ) -> Self {
        Self {
            request_id,
            model,
            decision: Decision::Abstain,
            confidence: 0.0,
            reasoning: reason.into(),
            required_changes: None,
            latency_ms: None,
            recorded_at,
        }
    }
}
