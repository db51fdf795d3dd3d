use thiserror::Error;

/// How a failure should be handled by the caller that hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff; surface as failure once the budget is exhausted.
    Transient,
    /// Never re-queue: auth failures, malformed input.
    NonRetryable,
    /// Reject the caller; possibly pause the system. Not a task failure.
    Quota,
    /// Count the offending vote as ABSTAIN and log a security event.
    Schema,
    /// Refuse to operate on the affected resource; degrade gracefully.
    Integrity,
    /// Left for the self-healer to requeue.
    Stale,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Stale)
    }
}

#[derive(Debug, Error)]
pub enum TriadError {
    // ── Store errors ─────────────────────────────────────────────────────────
    #[error("store unavailable after {attempts} attempts: {detail}")]
    StoreUnavailable { attempts: u32, detail: String },

    #[error("sql error: {0}")]
    Sql(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("illegal transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("transition lost race for task {task_id} (state changed concurrently)")]
    TransitionConflict { task_id: String },

    #[error("retry budget exhausted for task {task_id} ({retries} retries)")]
    RetriesExhausted { task_id: String, retries: u32 },

    // ── Lock errors ──────────────────────────────────────────────────────────
    #[error("lock acquisition timed out on {path} after {waited_s}s")]
    LockTimeout { path: String, waited_s: u64 },

    #[error("lock file unreadable at {path}: {detail}")]
    LockCorrupt { path: String, detail: String },

    // ── Breaker / budget errors ──────────────────────────────────────────────
    #[error("circuit breaker open for model {model}")]
    BreakerOpen { model: String },

    #[error("daily budget guardrail: projected ${projected_usd:.2} >= threshold ${threshold_usd:.2}")]
    BudgetExhausted {
        projected_usd: f64,
        threshold_usd: f64,
    },

    #[error("rate limit exceeded for key {key}")]
    RateLimited { key: String },

    // ── Envelope / consensus errors ──────────────────────────────────────────
    #[error("invalid delegate envelope: {0}")]
    Envelope(String),

    #[error("invalid score {raw:?}: {reason}")]
    ScoreInvalid { raw: String, reason: String },

    #[error("consensus request {request_id} timed out")]
    ConsensusTimeout { request_id: String },

    // ── Delegate transport errors ────────────────────────────────────────────
    #[error("transport failure calling {model}: {detail}")]
    Transport { model: String, detail: String },

    #[error("authentication failure calling {model}")]
    Auth { model: String },

    #[error("delegate {model} returned status {status}")]
    DelegateStatus { model: String, status: String },

    #[error("delegate {model} did not answer within {timeout_s}s")]
    DelegateTimeout { model: String, timeout_s: u64 },

    // ── Phase errors ─────────────────────────────────────────────────────────
    #[error("illegal phase order: {from} -> {to}")]
    PhaseOrder { from: String, to: String },

    #[error("phase {phase} gate is not passed")]
    GateBlocked { phase: String },

    #[error("phase {phase} missing required artifact {artifact}")]
    ArtifactMissing { phase: String, artifact: String },

    // ── Integrity errors ─────────────────────────────────────────────────────
    #[error("integrity violation: {0}")]
    Integrity(String),

    // ── Configuration / boot errors ──────────────────────────────────────────
    #[error("configuration error: {0}")]
    Config(String),

    // ── Worker / task liveness errors ────────────────────────────────────────
    #[error("worker {0} is stale")]
    WorkerStale(String),

    #[error("task {task_id} exceeded its wall clock ({elapsed_s}s)")]
    TaskWallClock { task_id: String, elapsed_s: i64 },

    // ── General ──────────────────────────────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl TriadError {
    /// Map an error to its disposition class from the taxonomy.
    pub fn class(&self) -> ErrorClass {
        use TriadError::*;
        match self {
            StoreUnavailable { .. } | Sql(_) | Transport { .. } | DelegateStatus { .. }
            | DelegateTimeout { .. } | ConsensusTimeout { .. } | TransitionConflict { .. }
            | Io(_) => ErrorClass::Transient,

            Auth { .. } | Config(_) | Serialization(_) | TaskNotFound(_)
            | InvalidTransition { .. } | RetriesExhausted { .. } | PhaseOrder { .. }
            | GateBlocked { .. } | ArtifactMissing { .. } | Other(_) => ErrorClass::NonRetryable,

            BreakerOpen { .. } | BudgetExhausted { .. } | RateLimited { .. } => ErrorClass::Quota,

            Envelope(_) | ScoreInvalid { .. } => ErrorClass::Schema,

            Integrity(_) | LockCorrupt { .. } => ErrorClass::Integrity,

            WorkerStale(_) | TaskWallClock { .. } | LockTimeout { .. } => ErrorClass::Stale,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retryable() {
        let e = TriadError::Transport {
            model: "codex".into(),
            detail: "connection reset".into(),
        };
        assert_eq!(e.class(), ErrorClass::Transient);
        assert!(e.is_retryable());
    }

    #[test]
    fn auth_failures_are_not_retryable() {
        let e = TriadError::Auth {
            model: "claude".into(),
        };
        assert_eq!(e.class(), ErrorClass::NonRetryable);
        assert!(!e.is_retryable());
    }

    #[test]
    fn quota_errors_are_not_task_failures() {
        let e = TriadError::BudgetExhausted {
            projected_usd: 9.5,
            threshold_usd: 8.5,
        };
        assert_eq!(e.class(), ErrorClass::Quota);
        assert!(!e.is_retryable());
    }

    #[test]
    fn envelope_violations_are_schema_class() {
        assert_eq!(
            TriadError::Envelope("missing decision".into()).class(),
            ErrorClass::Schema
        );
        assert_eq!(
            TriadError::ScoreInvalid {
                raw: "$(rm -rf /)".into(),
                reason: "metacharacter".into()
            }
            .class(),
            ErrorClass::Schema
        );
    }
}
