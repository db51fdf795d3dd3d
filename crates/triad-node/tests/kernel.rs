//! End-to-end kernel scenarios: submit → claim → phase gates → final review
//! → terminal state, with scripted delegates standing in for the trio.
//!
//! Run with:
//!   cargo test -p triad-node --test kernel

use std::sync::Arc;
use std::time::Duration;

use triad_consensus::{AggregationRules, ConsensusEngine, Roster};
use triad_core::task::NewTask;
use triad_core::types::{Decision, Priority, TaskState, TraceId, WorkerId};
use triad_delegate::ScriptedAdapter;
use triad_node::worker::{run_once, WorkerDeps};
use triad_phases::PhaseController;
use triad_queue::Scheduler;
use triad_store::tasks::ClaimFilter;
use triad_store::Store;

// ── Stack assembly ────────────────────────────────────────────────────────────

fn stack(dir: &std::path::Path, adapter: ScriptedAdapter) -> (Arc<Store>, Arc<WorkerDeps>) {
    let store = Arc::new(Store::open(dir).unwrap());
    let engine = Arc::new(ConsensusEngine::new(
        Arc::clone(&store),
        Arc::new(adapter),
        Roster::default(),
        AggregationRules::default(),
        Duration::from_secs(5),
    ));
    let phases = Arc::new(PhaseController::new(Arc::clone(&store), Arc::clone(&engine)));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&store)));
    let deps = Arc::new(WorkerDeps {
        store: Arc::clone(&store),
        scheduler,
        phases,
        engine,
        claim_filter: ClaimFilter::default(),
        wall_clock_secs: 3_600,
        idle_sleep: Duration::from_millis(10),
    });
    (store, deps)
}

/// Queue five unanimous phase-gate approvals for the full trio.
fn approve_all_phase_gates(mut adapter: ScriptedAdapter) -> ScriptedAdapter {
    for _ in 0..5 {
        adapter = adapter
            .respond("claude", Decision::Approve, 0.9)
            .respond("codex", Decision::Approve, 0.9)
            .respond("gemini", Decision::Approve, 0.9);
    }
    adapter
}

fn submit(deps: &WorkerDeps, name: &str, priority: Priority) -> triad_core::types::TaskId {
    deps.scheduler
        .submit(
            NewTask::new(name, "IMPLEMENTATION", priority, "write function foo()"),
            TraceId::generate(),
            chrono::Utc::now().timestamp(),
        )
        .unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_runs_to_completed() {
    let dir = tempfile::tempdir().unwrap();
    // Five phase gates, then the final IMPLEMENTATION review (codex, claude).
    let adapter = approve_all_phase_gates(ScriptedAdapter::new())
        .respond("codex", Decision::Approve, 0.85)
        .respond("claude", Decision::Approve, 0.8);
    let (store, deps) = stack(dir.path(), adapter);

    let id = submit(&deps, "build-feature", Priority::High);
    let worker = WorkerId::new("worker-0-1");
    let ran = run_once(&deps, &worker, chrono::Utc::now().timestamp())
        .await
        .unwrap();
    assert_eq!(ran, Some(id.clone()));

    let task = store.get_task(&id).unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert!(task.worker_id.is_none());

    let result: serde_json::Value = serde_json::from_str(task.result.as_deref().unwrap()).unwrap();
    assert_eq!(result["final_decision"], "APPROVE");
    assert_eq!(result["phases"].as_array().unwrap().len(), 5);

    // Every phase gate passed.
    for phase in ["BRAINSTORM", "DOCUMENT", "PLAN", "EXECUTE", "TRACK"] {
        let row = store.get_phase_row(&id, phase).unwrap().unwrap();
        assert_eq!(row.gate_status, triad_core::types::GateStatus::Passed);
    }
}

#[tokio::test]
async fn final_review_reject_requeues_with_retry() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = approve_all_phase_gates(ScriptedAdapter::new())
        .respond("codex", Decision::Approve, 0.9)
        .respond("claude", Decision::Reject, 0.95);
    let (store, deps) = stack(dir.path(), adapter);

    let id = submit(&deps, "build-feature", Priority::High);
    let worker = WorkerId::new("worker-0-1");
    run_once(&deps, &worker, chrono::Utc::now().timestamp())
        .await
        .unwrap();

    // Single blocker wins: rejected, retry charged, back in the queue.
    let task = store.get_task(&id).unwrap();
    assert_eq!(task.state, TaskState::Queued);
    assert_eq!(task.retry_count, 1);

    let kinds: Vec<String> = store
        .events_for_aggregate("task", id.as_str())
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&"STATE_CHANGED".to_string()));
}

#[tokio::test]
async fn early_gate_rejection_stops_the_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    // BRAINSTORM gate: one reject among the trio.
    let adapter = ScriptedAdapter::new()
        .respond("claude", Decision::Reject, 0.9)
        .respond("codex", Decision::Approve, 0.9)
        .respond("gemini", Decision::Approve, 0.9);
    let (store, deps) = stack(dir.path(), adapter);

    let id = submit(&deps, "half-baked", Priority::Medium);
    let worker = WorkerId::new("worker-0-1");
    run_once(&deps, &worker, chrono::Utc::now().timestamp())
        .await
        .unwrap();

    let task = store.get_task(&id).unwrap();
    assert_eq!(task.state, TaskState::Queued);
    assert_eq!(task.retry_count, 1);

    let row = store.get_phase_row(&id, "BRAINSTORM").unwrap().unwrap();
    assert_eq!(row.gate_status, triad_core::types::GateStatus::Failed);
    // DOCUMENT never started.
    assert!(store.get_phase_row(&id, "DOCUMENT").unwrap().is_none());
}

#[tokio::test]
async fn low_confidence_approvals_leave_request_pending_and_task_retries() {
    let dir = tempfile::tempdir().unwrap();
    // All three approve the first gate, but below the confidence floor.
    let adapter = ScriptedAdapter::new()
        .respond("claude", Decision::Approve, 0.5)
        .respond("codex", Decision::Approve, 0.6)
        .respond("gemini", Decision::Approve, 0.65);
    let (store, deps) = stack(dir.path(), adapter);

    let id = submit(&deps, "uncertain", Priority::Medium);
    let worker = WorkerId::new("worker-0-1");
    run_once(&deps, &worker, chrono::Utc::now().timestamp())
        .await
        .unwrap();

    // Undecided reviews are transient failures: requeued with a retry.
    let task = store.get_task(&id).unwrap();
    assert_eq!(task.state, TaskState::Queued);
    assert_eq!(task.retry_count, 1);
}

#[tokio::test]
async fn rejected_task_resumes_from_failed_phase_not_from_scratch() {
    let dir = tempfile::tempdir().unwrap();
    // Round 1: BRAINSTORM passes, DOCUMENT fails.
    // Round 2: DOCUMENT passes, then PLAN/EXECUTE/TRACK, then final review.
    let mut adapter = ScriptedAdapter::new()
        // round 1: BRAINSTORM approve ×3
        .respond("claude", Decision::Approve, 0.9)
        .respond("codex", Decision::Approve, 0.9)
        .respond("gemini", Decision::Approve, 0.9)
        // round 1: DOCUMENT reject
        .respond("claude", Decision::Reject, 0.9)
        .respond("codex", Decision::Approve, 0.9)
        .respond("gemini", Decision::Approve, 0.9);
    // round 2: DOCUMENT, PLAN, EXECUTE, TRACK approve ×3 each
    for _ in 0..4 {
        adapter = adapter
            .respond("claude", Decision::Approve, 0.9)
            .respond("codex", Decision::Approve, 0.9)
            .respond("gemini", Decision::Approve, 0.9);
    }
    // round 2: final IMPLEMENTATION review
    let adapter = adapter
        .respond("codex", Decision::Approve, 0.9)
        .respond("claude", Decision::Approve, 0.9);

    let (store, deps) = stack(dir.path(), adapter);
    let id = submit(&deps, "two-rounds", Priority::High);
    let worker = WorkerId::new("worker-0-1");

    run_once(&deps, &worker, chrono::Utc::now().timestamp())
        .await
        .unwrap();
    assert_eq!(store.get_task(&id).unwrap().state, TaskState::Queued);

    run_once(&deps, &worker, chrono::Utc::now().timestamp())
        .await
        .unwrap();
    let task = store.get_task(&id).unwrap();
    assert_eq!(task.state, TaskState::Completed);

    // BRAINSTORM was approved once, in round 1: its gate ran exactly once.
    let brainstorm_votes: i64 = store
        .with_conn(|c| {
            c.query_row(
                "SELECT COUNT(*) FROM consensus_votes v \
                 JOIN consensus_requests r ON r.id = v.request_id \
                 WHERE r.review_type = 'BRAINSTORM'",
                [],
                |r| r.get(0),
            )
        })
        .unwrap();
    assert_eq!(brainstorm_votes, 3);
}

#[tokio::test]
async fn paused_kernel_claims_nothing_until_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = approve_all_phase_gates(ScriptedAdapter::new())
        .respond("codex", Decision::Approve, 0.9)
        .respond("claude", Decision::Approve, 0.9);
    let (store, deps) = stack(dir.path(), adapter);

    submit(&deps, "waiting", Priority::Critical);
    store.set_paused("operator").unwrap();

    let worker = WorkerId::new("worker-0-1");
    let ran = run_once(&deps, &worker, chrono::Utc::now().timestamp())
        .await
        .unwrap();
    assert!(ran.is_none());

    store.clear_paused().unwrap();
    let ran = run_once(&deps, &worker, chrono::Utc::now().timestamp())
        .await
        .unwrap();
    assert!(ran.is_some());
}
