use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TriadError;

/// Unix timestamp (seconds, UTC).
pub type Timestamp = i64;

// ── TaskId ───────────────────────────────────────────────────────────────────

/// Unique task identifier: `task-<uuid>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(format!("task-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

// ── WorkerId ─────────────────────────────────────────────────────────────────

/// Worker identifier: `worker-<n>-<pid>` or operator-assigned.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

// ── RequestId ────────────────────────────────────────────────────────────────

/// Consensus review request identifier: `review-<uuid>`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(format!("review-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

// ── TraceId ──────────────────────────────────────────────────────────────────

/// Correlation id propagated across every store write, delegate call, vote,
/// lock record, and cost row caused by one logical operation.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Seed from the environment (`TRACE_ID`) or generate a fresh root trace.
    pub fn from_env_or_generate() -> Self {
        match std::env::var("TRACE_ID") {
            Ok(v) if !v.trim().is_empty() => Self(v),
            _ => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.0)
    }
}

// ── ModelId ──────────────────────────────────────────────────────────────────

/// Delegate model nickname (`claude`, `codex`, `gemini`). The kernel works
/// with any roster of two or more; the three nicknames are the default set.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId(pub String);

impl ModelId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModelId({})", self.0)
    }
}

// ── Priority ─────────────────────────────────────────────────────────────────

/// Scheduling lane. Lower numeric value = served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Critical),
            1 => Some(Self::High),
            2 => Some(Self::Medium),
            3 => Some(Self::Low),
            _ => None,
        }
    }

    /// The lane one step above, or `None` when already CRITICAL.
    pub fn promoted(self) -> Option<Self> {
        match self {
            Self::Low => Some(Self::Medium),
            Self::Medium => Some(Self::High),
            Self::High => Some(Self::Critical),
            Self::Critical => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = TriadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Self::Critical),
            "HIGH" => Ok(Self::High),
            "MEDIUM" => Ok(Self::Medium),
            "LOW" => Ok(Self::Low),
            other => Err(TriadError::Config(format!("unknown priority: {other}"))),
        }
    }
}

// ── TaskState ────────────────────────────────────────────────────────────────

/// Canonical task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Queued,
    Running,
    Review,
    Approved,
    Rejected,
    Completed,
    Failed,
    Escalated,
    Timeout,
    Paused,
    Cancelled,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Review => "REVIEW",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Escalated => "ESCALATED",
            Self::Timeout => "TIMEOUT",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TriadError> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "REVIEW" => Ok(Self::Review),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "ESCALATED" => Ok(Self::Escalated),
            "TIMEOUT" => Ok(Self::Timeout),
            "PAUSED" => Ok(Self::Paused),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(TriadError::Serialization(format!(
                "unknown task state: {other}"
            ))),
        }
    }

    /// COMPLETED, ESCALATED, and CANCELLED accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Escalated | Self::Cancelled)
    }

    /// The legal transition matrix. Any (from, to) pair not listed here is
    /// rejected by `transition_task` before touching the store.
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        match self {
            Queued => matches!(to, Running | Cancelled),
            Running => matches!(to, Review | Timeout | Paused | Cancelled | Failed | Completed),
            Review => matches!(to, Approved | Rejected | Escalated | Failed),
            Rejected => matches!(to, Queued | Escalated),
            Timeout => matches!(to, Queued | Escalated),
            Paused => matches!(to, Running | Cancelled | Queued),
            Approved => matches!(to, Completed | Escalated),
            Failed => matches!(to, Queued | Escalated | Cancelled),
            Completed | Escalated | Cancelled => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Decision ─────────────────────────────────────────────────────────────────

/// A delegate's vote on a review. ABSTAIN is also the bucket for every
/// malformed, low-confidence, or missing response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "APPROVE")]
    Approve,
    #[serde(rename = "REJECT")]
    Reject,
    #[serde(rename = "ABSTAIN")]
    Abstain,
    #[serde(rename = "REQUEST_CHANGES")]
    RequestChanges,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::Reject => "REJECT",
            Self::Abstain => "ABSTAIN",
            Self::RequestChanges => "REQUEST_CHANGES",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TriadError> {
        match s {
            "APPROVE" => Ok(Self::Approve),
            "REJECT" => Ok(Self::Reject),
            "ABSTAIN" => Ok(Self::Abstain),
            "REQUEST_CHANGES" => Ok(Self::RequestChanges),
            other => Err(TriadError::Envelope(format!("unknown decision: {other}"))),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── RequestStatus ────────────────────────────────────────────────────────────

/// Lifecycle of a consensus review request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "APPROVED")]
    Approved,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "CHANGES_REQUESTED")]
    ChangesRequested,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "ERROR")]
    Error,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::ChangesRequested => "CHANGES_REQUESTED",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TriadError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "CHANGES_REQUESTED" => Ok(Self::ChangesRequested),
            "TIMEOUT" => Ok(Self::Timeout),
            "ERROR" => Ok(Self::Error),
            other => Err(TriadError::Serialization(format!(
                "unknown request status: {other}"
            ))),
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── GateStatus ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateStatus {
    Pending,
    Passed,
    Failed,
    Blocked,
}

impl GateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TriadError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PASSED" => Ok(Self::Passed),
            "FAILED" => Ok(Self::Failed),
            "BLOCKED" => Ok(Self::Blocked),
            other => Err(TriadError::Serialization(format!(
                "unknown gate status: {other}"
            ))),
        }
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── BreakerState ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TriadError> {
        match s {
            "CLOSED" => Ok(Self::Closed),
            "OPEN" => Ok(Self::Open),
            "HALF_OPEN" => Ok(Self::HalfOpen),
            other => Err(TriadError::Serialization(format!(
                "unknown breaker state: {other}"
            ))),
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
