use serde::{Deserialize, Serialize};

use crate::types::{Timestamp, TraceId};

// ── EventKind ────────────────────────────────────────────────────────────────

/// Append-only event vocabulary. The wire string is the SCREAMING form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "TASK_CREATED")]
    TaskCreated,
    #[serde(rename = "TASK_CLAIMED")]
    TaskClaimed,
    #[serde(rename = "STATE_CHANGED")]
    StateChanged,
    #[serde(rename = "TASK_COMPLETED")]
    TaskCompleted,
    #[serde(rename = "TASK_ESCALATED")]
    TaskEscalated,
    #[serde(rename = "PRIORITY_ESCALATED")]
    PriorityEscalated,
    #[serde(rename = "PREEMPT_CHECKPOINT")]
    PreemptCheckpoint,
    #[serde(rename = "RECOVER_STALE")]
    RecoverStale,
    #[serde(rename = "RECOVER_STUCK")]
    RecoverStuck,
    #[serde(rename = "VOTE_RECORDED")]
    VoteRecorded,
    #[serde(rename = "VOTE_REJECTED")]
    VoteRejected,
    #[serde(rename = "CONSENSUS_FINALIZED")]
    ConsensusFinalized,
    #[serde(rename = "PHASE_STARTED")]
    PhaseStarted,
    #[serde(rename = "ARTIFACT_RECORDED")]
    ArtifactRecorded,
    #[serde(rename = "GATE_PASSED")]
    GatePassed,
    #[serde(rename = "GATE_FAILED")]
    GateFailed,
    #[serde(rename = "BREAKER_OPENED")]
    BreakerOpened,
    #[serde(rename = "BREAKER_HALF_OPEN")]
    BreakerHalfOpen,
    #[serde(rename = "BREAKER_CLOSED")]
    BreakerClosed,
    #[serde(rename = "COST_REFUSED")]
    CostRefused,
    #[serde(rename = "COST_RECORDED")]
    CostRecorded,
    #[serde(rename = "WORKER_REGISTERED")]
    WorkerRegistered,
    #[serde(rename = "WORKER_DEAD")]
    WorkerDead,
    #[serde(rename = "HEALING_TICK")]
    HealingTick,
    #[serde(rename = "INTEGRITY_VIOLATION")]
    IntegrityViolation,
    #[serde(rename = "SYSTEM_PAUSED")]
    SystemPaused,
    #[serde(rename = "SYSTEM_RESUMED")]
    SystemResumed,
    #[serde(rename = "ROUTING_DECIDED")]
    RoutingDecided,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "TASK_CREATED",
            Self::TaskClaimed => "TASK_CLAIMED",
            Self::StateChanged => "STATE_CHANGED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskEscalated => "TASK_ESCALATED",
            Self::PriorityEscalated => "PRIORITY_ESCALATED",
            Self::PreemptCheckpoint => "PREEMPT_CHECKPOINT",
            Self::RecoverStale => "RECOVER_STALE",
            Self::RecoverStuck => "RECOVER_STUCK",
            Self::VoteRecorded => "VOTE_RECORDED",
            Self::VoteRejected => "VOTE_REJECTED",
            Self::ConsensusFinalized => "CONSENSUS_FINALIZED",
            Self::PhaseStarted => "PHASE_STARTED",
            Self::ArtifactRecorded => "ARTIFACT_RECORDED",
            Self::GatePassed => "GATE_PASSED",
            Self::GateFailed => "GATE_FAILED",
            Self::BreakerOpened => "BREAKER_OPENED",
            Self::BreakerHalfOpen => "BREAKER_HALF_OPEN",
            Self::BreakerClosed => "BREAKER_CLOSED",
            Self::CostRefused => "COST_REFUSED",
            Self::CostRecorded => "COST_RECORDED",
            Self::WorkerRegistered => "WORKER_REGISTERED",
            Self::WorkerDead => "WORKER_DEAD",
            Self::HealingTick => "HEALING_TICK",
            Self::IntegrityViolation => "INTEGRITY_VIOLATION",
            Self::SystemPaused => "SYSTEM_PAUSED",
            Self::SystemResumed => "SYSTEM_RESUMED",
            Self::RoutingDecided => "ROUTING_DECIDED",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Event ────────────────────────────────────────────────────────────────────

/// One append-only event record. Never updated, never deleted. `seq` is
/// assigned by the store and is monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub ts: Timestamp,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub trace_id: TraceId,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
}

/// What a caller provides when appending; the store assigns `seq` and `ts`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub trace_id: TraceId,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl NewEvent {
    pub fn task(id: impl Into<String>, kind: EventKind, trace_id: TraceId) -> Self {
        Self {
            aggregate_type: "task".into(),
            aggregate_id: id.into(),
            kind,
            payload: serde_json::Value::Null,
            trace_id,
            causation_id: None,
            correlation_id: None,
        }
    }

    pub fn system(kind: EventKind, trace_id: TraceId) -> Self {
        Self {
            aggregate_type: "system".into(),
            aggregate_id: "kernel".into(),
            kind,
            payload: serde_json::Value::Null,
            trace_id,
            causation_id: None,
            correlation_id: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn caused_by(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_stale_wire_name_is_stable() {
        // The healing audit trail greps for this exact string.
        assert_eq!(EventKind::RecoverStale.as_str(), "RECOVER_STALE");
    }

    #[test]
    fn builder_carries_payload_and_causation() {
        let e = NewEvent::task("task-1", EventKind::StateChanged, TraceId::generate())
            .with_payload(serde_json::json!({"from": "QUEUED", "to": "RUNNING"}))
            .caused_by("claim-7");
        assert_eq!(e.aggregate_type, "task");
        assert_eq!(e.causation_id.as_deref(), Some("claim-7"));
        assert_eq!(e.payload["from"], "QUEUED");
    }
}
