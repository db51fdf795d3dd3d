//! The worker pipeline: claim → drive the SDLC phases through their gates →
//! final task-type review → record the structured result.
//!
//! Each claimed task walks BRAINSTORM → DOCUMENT → PLAN → EXECUTE → TRACK,
//! passing the consensus gate at every boundary, then faces a final review
//! under its own task type's roster. Artifact *content* comes from the
//! delegates; the kernel records the artifact entries and enforces the
//! gates.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use triad_consensus::{ConsensusEngine, Outcome, ReviewSpec};
use triad_core::task::{Task, Worker, WorkerStatus};
use triad_core::types::{Decision, TaskId, TaskState, Timestamp, TraceId, WorkerId};
use triad_core::TriadError;
use triad_phases::{Phase, PhaseController};
use triad_queue::Scheduler;
use triad_store::tasks::ClaimFilter;
use triad_store::Store;

pub struct WorkerDeps {
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub phases: Arc<PhaseController>,
    pub engine: Arc<ConsensusEngine>,
    pub claim_filter: ClaimFilter,
    /// Per-task wall clock; exceeded runs go through TIMEOUT.
    pub wall_clock_secs: i64,
    pub idle_sleep: Duration,
}

/// Register, then loop claiming and executing until the process exits.
pub async fn run_worker(deps: Arc<WorkerDeps>, id: WorkerId) {
    let now = chrono::Utc::now().timestamp();
    let worker = Worker {
        id: id.clone(),
        pid: std::process::id(),
        status: WorkerStatus::Starting,
        specialization: None,
        shard: deps.claim_filter.shard.clone(),
        model: deps.claim_filter.model.clone(),
        started_at: now,
        last_heartbeat: now,
        tasks_completed: 0,
        tasks_failed: 0,
        crash_count: 0,
        current_task: None,
    };
    if let Err(e) = deps.store.register_worker(&worker, &TraceId::from_env_or_generate()) {
        warn!(worker = %id, error = %e, "worker registration failed");
        return;
    }

    loop {
        let now = chrono::Utc::now().timestamp();
        match run_once(&deps, &id, now).await {
            Ok(Some(task_id)) => {
                info!(worker = %id, task_id = %task_id, "task run finished");
            }
            Ok(None) => {
                let _ = deps
                    .store
                    .heartbeat_worker(&id, None, WorkerStatus::Idle, now);
                tokio::time::sleep(deps.idle_sleep).await;
            }
            Err(e) => {
                warn!(worker = %id, error = %e, "worker iteration failed");
                tokio::time::sleep(deps.idle_sleep).await;
            }
        }
    }
}

/// Claim and fully execute one task. `Ok(None)` when the queue is empty or
/// the system is paused.
pub async fn run_once(
    deps: &WorkerDeps,
    worker: &WorkerId,
    now: Timestamp,
) -> Result<Option<TaskId>, TriadError> {
    let Some(task) = deps.scheduler.claim(worker, &deps.claim_filter, now)? else {
        return Ok(None);
    };
    deps.store
        .heartbeat_worker(worker, Some(&task.id), WorkerStatus::Busy, now)?;

    let id = task.id.clone();
    execute_task(deps, worker, task).await?;
    deps.store
        .heartbeat_worker(worker, None, WorkerStatus::Idle, chrono::Utc::now().timestamp())?;
    Ok(Some(id))
}

enum RunOutcome {
    Completed(serde_json::Value),
    Blocked(Outcome),
    Undecided(Outcome),
}

async fn execute_task(
    deps: &WorkerDeps,
    worker: &WorkerId,
    task: Task,
) -> Result<(), TriadError> {
    let id = task.id.clone();

    match drive(deps, &task).await {
        Ok(RunOutcome::Completed(result)) => {
            let now = chrono::Utc::now().timestamp();
            deps.store
                .record_result(&id, &result.to_string(), now)?;
            deps.store
                .transition_task(&id, TaskState::Review, "lifecycle complete", worker.as_str(), now)?;
            deps.store
                .transition_task(&id, TaskState::Approved, "final review approved", worker.as_str(), now)?;
            deps.store
                .transition_task(&id, TaskState::Completed, "", worker.as_str(), now)?;
            deps.store.bump_worker_completed(worker)?;
            info!(task_id = %id, "task completed");
        }
        Ok(RunOutcome::Blocked(outcome)) => {
            let now = chrono::Utc::now().timestamp();
            let reason = match outcome.final_decision {
                Decision::RequestChanges => "changes requested",
                _ => "review rejected",
            };
            deps.store.record_result(
                &id,
                &serde_json::json!({
                    "final_decision": outcome.final_decision.as_str(),
                    "blocking_reasons": outcome.blocking_reasons,
                    "required_changes": outcome.required_changes,
                })
                .to_string(),
                now,
            )?;
            deps.store
                .transition_task(&id, TaskState::Review, "review decided", worker.as_str(), now)?;
            deps.store
                .transition_task(&id, TaskState::Rejected, reason, worker.as_str(), now)?;
            deps.store.requeue_or_escalate(&id, reason, worker.as_str(), now)?;
            deps.store.bump_worker_failed(worker)?;
        }
        Ok(RunOutcome::Undecided(outcome)) => {
            // Not enough confident votes either way: transient, retry.
            let now = chrono::Utc::now().timestamp();
            let e = TriadError::ConsensusTimeout {
                request_id: outcome.request_id.unwrap_or_else(|| "-".into()),
            };
            deps.store.mark_task_failed(&id, &e, worker.as_str(), now)?;
            deps.store.bump_worker_failed(worker)?;
        }
        Err(TriadError::TaskWallClock { elapsed_s, .. }) => {
            let now = chrono::Utc::now().timestamp();
            deps.store.transition_task(
                &id,
                TaskState::Timeout,
                &format!("wall clock exceeded ({elapsed_s}s)"),
                worker.as_str(),
                now,
            )?;
            deps.store
                .requeue_or_escalate(&id, "wall clock exceeded", worker.as_str(), now)?;
            deps.store.bump_worker_failed(worker)?;
        }
        Err(e) => {
            let now = chrono::Utc::now().timestamp();
            match e.class() {
                // Quota refusals are our own backpressure, not task
                // failures: park the task back in the queue untouched.
                triad_core::error::ErrorClass::Quota => {
                    warn!(task_id = %id, error = %e, "task parked by quota gate");
                    deps.store
                        .transition_task(&id, TaskState::Paused, &e.to_string(), worker.as_str(), now)?;
                    deps.store
                        .transition_task(&id, TaskState::Queued, "requeued after quota pause", worker.as_str(), now)?;
                }
                _ => {
                    deps.store.mark_task_failed(&id, &e, worker.as_str(), now)?;
                    deps.store.bump_worker_failed(worker)?;
                }
            }
        }
    }
    Ok(())
}

/// Walk the phase gates, then the final task-type review.
async fn drive(deps: &WorkerDeps, task: &Task) -> Result<RunOutcome, TriadError> {
    let trace = task.trace_id.clone();
    let started = task.started_at.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let mut trail: Vec<serde_json::Value> = Vec::new();

    // Resume where a previous run left off.
    let mut phase = match deps.phases.current_phase(&task.id)? {
        None => {
            let now = chrono::Utc::now().timestamp();
            deps.phases
                .start_phase(&task.id, Phase::initial(), &trace, now)?;
            Phase::initial()
        }
        Some(current) => current,
    };

    loop {
        let now = chrono::Utc::now().timestamp();
        if now - started > deps.wall_clock_secs {
            return Err(TriadError::TaskWallClock {
                task_id: task.id.to_string(),
                elapsed_s: now - started,
            });
        }

        deps.store.heartbeat_task(&task.id, now)?;

        // If this phase's gate already passed (resumed task), step forward.
        let already_passed = deps
            .store
            .get_phase_row(&task.id, phase.as_str())?
            .map(|r| r.gate_status == triad_core::types::GateStatus::Passed)
            .unwrap_or(false);
        if already_passed {
            match phase.next() {
                Some(next) => {
                    deps.phases.start_phase(&task.id, next, &trace, now)?;
                    phase = next;
                    continue;
                }
                None => break,
            }
        }

        for artifact in phase.required_artifacts() {
            deps.phases
                .record_artifact(&task.id, phase, artifact, None, &trace, now)?;
        }

        let outcome = deps
            .phases
            .request_gate_approval(&task.id, phase, &task.payload, &trace, now)
            .await?;
        trail.push(serde_json::json!({
            "phase": phase.as_str(),
            "decision": outcome.final_decision.as_str(),
            "approvals": outcome.approvals,
        }));

        if outcome.approved() && outcome.approvals >= 2 {
            match phase.next() {
                Some(next) => {
                    let now = chrono::Utc::now().timestamp();
                    deps.phases.start_phase(&task.id, next, &trace, now)?;
                    phase = next;
                }
                None => break,
            }
        } else if matches!(
            outcome.final_decision,
            Decision::Reject | Decision::RequestChanges
        ) {
            return Ok(RunOutcome::Blocked(outcome));
        } else {
            return Ok(RunOutcome::Undecided(outcome));
        }
    }

    // All five gates passed: final review under the task's own type.
    let final_review = deps
        .engine
        .review(
            &ReviewSpec {
                task_id: task.id.clone(),
                review_type: task.task_type.clone(),
                subject: task.name.clone(),
                context: task.payload.clone(),
            },
            &trace,
        )
        .await?;

    if final_review.approved() {
        Ok(RunOutcome::Completed(serde_json::json!({
            "final_decision": final_review.final_decision.as_str(),
            "approvals": final_review.approvals,
            "rejections": final_review.rejections,
            "abstentions": final_review.abstentions,
            "phases": trail,
        })))
    } else if matches!(
        final_review.final_decision,
        Decision::Reject | Decision::RequestChanges
    ) {
        Ok(RunOutcome::Blocked(final_review))
    } else {
        Ok(RunOutcome::Undecided(final_review))
    }
}
