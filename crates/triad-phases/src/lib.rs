//! The phase-gate controller.
//!
//! Tasks move through BRAINSTORM → DOCUMENT → PLAN → EXECUTE → TRACK, and
//! may not leave a phase until its named artifacts are recorded and the
//! consensus gate for that phase passes. Backward movement is allowed one
//! step at a time, and only while the current phase's gate has not passed —
//! a passed gate is an audited approval and stays final.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use triad_consensus::{ConsensusEngine, Outcome, ReviewSpec};
use triad_core::types::{GateStatus, TaskId, Timestamp, TraceId};
use triad_core::TriadError;
use triad_store::Store;

// ── Phase ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Brainstorm,
    Document,
    Plan,
    Execute,
    Track,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Brainstorm,
        Phase::Document,
        Phase::Plan,
        Phase::Execute,
        Phase::Track,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Brainstorm => "BRAINSTORM",
            Self::Document => "DOCUMENT",
            Self::Plan => "PLAN",
            Self::Execute => "EXECUTE",
            Self::Track => "TRACK",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TriadError> {
        match s {
            "BRAINSTORM" => Ok(Self::Brainstorm),
            "DOCUMENT" => Ok(Self::Document),
            "PLAN" => Ok(Self::Plan),
            "EXECUTE" => Ok(Self::Execute),
            "TRACK" => Ok(Self::Track),
            other => Err(TriadError::Serialization(format!("unknown phase: {other}"))),
        }
    }

    pub fn initial() -> Self {
        Self::Brainstorm
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Brainstorm => Some(Self::Document),
            Self::Document => Some(Self::Plan),
            Self::Plan => Some(Self::Execute),
            Self::Execute => Some(Self::Track),
            Self::Track => None,
        }
    }

    pub fn prev(self) -> Option<Self> {
        match self {
            Self::Brainstorm => None,
            Self::Document => Some(Self::Brainstorm),
            Self::Plan => Some(Self::Document),
            Self::Execute => Some(Self::Plan),
            Self::Track => Some(Self::Execute),
        }
    }

    /// Artifacts that must be recorded before this phase's gate may run.
    pub fn required_artifacts(self) -> &'static [&'static str] {
        match self {
            Self::Brainstorm => &["brainstorm.md"],
            Self::Document => &["spec.md", "acceptance_criteria.md"],
            Self::Plan => &["plan.md", "task_breakdown.md"],
            Self::Execute => &["implementation_notes.md"],
            Self::Track => &["status_report.md"],
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── PhaseController ──────────────────────────────────────────────────────────

pub struct PhaseController {
    store: Arc<Store>,
    engine: Arc<ConsensusEngine>,
}

impl PhaseController {
    pub fn new(store: Arc<Store>, engine: Arc<ConsensusEngine>) -> Self {
        Self { store, engine }
    }

    /// The most recently started phase, if any.
    pub fn current_phase(&self, task_id: &TaskId) -> Result<Option<Phase>, TriadError> {
        match self.store.latest_phase_row(task_id)? {
            Some(row) => Ok(Some(Phase::parse(&row.phase)?)),
            None => Ok(None),
        }
    }

    /// Begin `phase` for a task.
    ///
    /// Legal when: no phase has started and `phase` is BRAINSTORM; or
    /// `phase` is the current phase's successor and the current gate has
    /// passed; or `phase` is exactly one step back and the current gate has
    /// NOT passed.
    pub fn start_phase(
        &self,
        task_id: &TaskId,
        phase: Phase,
        trace: &TraceId,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        match self.current_phase(task_id)? {
            None => {
                if phase != Phase::initial() {
                    return Err(TriadError::PhaseOrder {
                        from: "(none)".into(),
                        to: phase.to_string(),
                    });
                }
            }
            Some(current) => {
                let gate = self
                    .store
                    .get_phase_row(task_id, current.as_str())?
                    .map(|r| r.gate_status)
                    .unwrap_or(GateStatus::Pending);

                if Some(phase) == current.next() {
                    if gate != GateStatus::Passed {
                        return Err(TriadError::GateBlocked {
                            phase: current.to_string(),
                        });
                    }
                } else if Some(phase) == current.prev() {
                    if gate == GateStatus::Passed {
                        return Err(TriadError::PhaseOrder {
                            from: current.to_string(),
                            to: phase.to_string(),
                        });
                    }
                    info!(task_id = %task_id, from = %current, to = %phase, "stepping back a phase");
                } else if phase != current {
                    return Err(TriadError::PhaseOrder {
                        from: current.to_string(),
                        to: phase.to_string(),
                    });
                }
            }
        }
        self.store
            .start_phase_row(task_id, phase.as_str(), trace, now)
    }

    pub fn record_artifact(
        &self,
        task_id: &TaskId,
        phase: Phase,
        name: &str,
        path: Option<&str>,
        trace: &TraceId,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        self.store
            .record_artifact(task_id, phase.as_str(), name, path, trace, now)
    }

    /// Run the consensus gate for `phase`.
    ///
    /// Verifies the required artifacts first, then reviews with
    /// `review_type = <phase>`. PASSED requires a final APPROVE with at
    /// least two approvals; anything else records FAILED with the blocking
    /// reasons attached.
    pub async fn request_gate_approval(
        &self,
        task_id: &TaskId,
        phase: Phase,
        context: &str,
        trace: &TraceId,
        now: Timestamp,
    ) -> Result<Outcome, TriadError> {
        let recorded = self.store.artifacts_for_phase(task_id, phase.as_str())?;
        for required in phase.required_artifacts() {
            if !recorded.iter().any(|a| a == required) {
                self.store.set_gate_status(
                    task_id,
                    phase.as_str(),
                    GateStatus::Blocked,
                    Some(&format!("missing artifact {required}")),
                    None,
                    None,
                    0,
                    0,
                    trace,
                    now,
                )?;
                return Err(TriadError::ArtifactMissing {
                    phase: phase.to_string(),
                    artifact: required.to_string(),
                });
            }
        }

        let spec = ReviewSpec {
            task_id: task_id.clone(),
            review_type: phase.as_str().to_string(),
            subject: format!("{phase} gate for {task_id}"),
            context: context.to_string(),
        };
        let outcome = self.engine.review(&spec, trace).await?;

        let passed = outcome.approved() && outcome.approvals >= 2;
        let status = if passed { GateStatus::Passed } else { GateStatus::Failed };
        let failures = if passed {
            None
        } else {
            Some(outcome.blocking_reasons.join("; "))
        };

        self.store.set_gate_status(
            task_id,
            phase.as_str(),
            status,
            failures.as_deref(),
            None,
            outcome.request_id.as_deref(),
            outcome.approvals,
            outcome.rejections,
            trace,
            now,
        )?;
        self.store.record_gate_decision(
            task_id,
            phase.as_str(),
            outcome.request_id.as_deref().unwrap_or("-"),
            outcome.final_decision.as_str(),
            now,
        )?;

        if passed {
            self.store.complete_phase_row(task_id, phase.as_str(), now)?;
            info!(task_id = %task_id, phase = %phase, "gate passed");
        } else {
            warn!(
                task_id = %task_id,
                phase = %phase,
                decision = %outcome.final_decision,
                "gate failed"
            );
        }
        Ok(outcome)
    }

    /// True once TRACK's gate has passed — the lifecycle is COMPLETE.
    pub fn is_complete(&self, task_id: &TaskId) -> Result<bool, TriadError> {
        Ok(self
            .store
            .get_phase_row(task_id, Phase::Track.as_str())?
            .map(|r| r.gate_status == GateStatus::Passed)
            .unwrap_or(false))
    }
}
