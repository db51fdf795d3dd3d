//! Scheduling on top of the store: submission, lane-ordered claiming,
//! wait-time escalation, and preemption.
//!
//! The four lanes live in the `priority` column; `claim_task` serves
//! CRITICAL → HIGH → MEDIUM → LOW, FIFO within a lane. Priority is data in
//! the store — any filename mirror a caller keeps is cosmetic, never the
//! source of truth.

use std::sync::Arc;

use tracing::info;

use triad_config::EscalationConfig;
use triad_core::constants::CHECKPOINT_PREVIEW_CHARS;
use triad_core::checksum::payload_checksum;
use triad_core::event::{EventKind, NewEvent};
use triad_core::task::{Checkpoint, NewTask, Task};
use triad_core::types::{Priority, TaskId, TaskState, Timestamp, TraceId, WorkerId};
use triad_core::TriadError;
use triad_store::tasks::ClaimFilter;
use triad_store::Store;

// ── Escalator ────────────────────────────────────────────────────────────────

/// Periodic lane promotion. A task's priority only ever rises.
pub struct Escalator {
    low_after: i64,
    medium_after: i64,
    high_after: i64,
}

impl Escalator {
    pub fn from_config(cfg: &EscalationConfig) -> Self {
        Self {
            low_after: cfg.low_after_seconds,
            medium_after: cfg.medium_after_seconds,
            high_after: cfg.high_after_seconds,
        }
    }

    pub fn tick(&self, store: &Store, now: Timestamp) -> Result<Vec<(TaskId, Priority)>, TriadError> {
        store.escalate_waiting(self.low_after, self.medium_after, self.high_after, now)
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────────

pub struct Scheduler {
    store: Arc<Store>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Submit a task. If its priority is strictly higher than the
    /// lowest-priority running task's, that runner is checkpointed and
    /// returned to the queue so the new arrival claims next.
    pub fn submit(
        &self,
        new_task: NewTask,
        trace: TraceId,
        now: Timestamp,
    ) -> Result<TaskId, TriadError> {
        let task = new_task.into_task(now, trace);
        let id = task.id.clone();
        let priority = task.priority;
        self.store.insert_task(&task)?;
        self.maybe_preempt(&id, priority, now)?;
        Ok(id)
    }

    /// Claim the next task for `worker` (lane order, FIFO within lane).
    pub fn claim(
        &self,
        worker: &WorkerId,
        filter: &ClaimFilter,
        now: Timestamp,
    ) -> Result<Option<Task>, TriadError> {
        self.store.claim_task(worker, filter, now)
    }

    /// Preemption is not retroactive: the victim's completed phases stay
    /// completed; only the in-flight run is checkpointed and requeued at
    /// its original priority.
    fn maybe_preempt(
        &self,
        incoming: &TaskId,
        incoming_priority: Priority,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        let Some(victim) = self.store.lowest_priority_running()? else {
            return Ok(());
        };
        if incoming_priority >= victim.priority {
            return Ok(());
        }

        let checkpoint = Checkpoint {
            task_id: victim.id.clone(),
            payload_checksum: payload_checksum(&victim.payload),
            preview: victim.payload.chars().take(CHECKPOINT_PREVIEW_CHARS).collect(),
            reason: format!(
                "preempted by {incoming} ({})",
                incoming_priority.as_str()
            ),
            preempted_by: incoming.clone(),
            at: now,
        };
        let checkpoint_json = serde_json::to_string(&checkpoint)
            .map_err(|e| TriadError::Serialization(e.to_string()))?;

        self.store.set_checkpoint(&victim.id, &checkpoint_json, now)?;
        self.store.append_event(
            &NewEvent::task(
                victim.id.as_str(),
                EventKind::PreemptCheckpoint,
                victim.trace_id.clone(),
            )
            .with_payload(serde_json::json!({
                "preempted_by": incoming.as_str(),
                "reason": checkpoint.reason,
                "preview": checkpoint.preview,
            })),
            now,
        )?;

        // RUNNING has no direct edge to QUEUED; the checkpoint pause is the
        // legal route and releases the worker slot on the first hop.
        self.store
            .transition_task(&victim.id, TaskState::Paused, &checkpoint.reason, "scheduler", now)?;
        self.store
            .transition_task(&victim.id, TaskState::Queued, "requeued after preemption", "scheduler", now)?;

        info!(
            victim = %victim.id,
            incoming = %incoming,
            victim_priority = %victim.priority,
            incoming_priority = %incoming_priority,
            "preempted running task"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> (tempfile::TempDir, Arc<Store>, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let scheduler = Scheduler::new(Arc::clone(&store));
        (dir, store, scheduler)
    }

    fn submit(s: &Scheduler, name: &str, priority: Priority, now: Timestamp) -> TaskId {
        s.submit(
            NewTask::new(name, "IMPLEMENTATION", priority, format!("payload of {name}")),
            TraceId::generate(),
            now,
        )
        .unwrap()
    }

    #[test]
    fn critical_arrival_preempts_running_low() {
        let (_dir, store, scheduler) = scheduler();
        let worker = WorkerId::new("worker-1-1");

        let low = submit(&scheduler, "background-cleanup", Priority::Low, 100);
        let claimed = scheduler.claim(&worker, &ClaimFilter::default(), 110).unwrap().unwrap();
        assert_eq!(claimed.id, low);

        let critical = submit(&scheduler, "hotfix", Priority::Critical, 120);

        // The LOW task is back in the queue at its original priority, with a
        // checkpoint recorded.
        let victim = store.get_task(&low).unwrap();
        assert_eq!(victim.state, TaskState::Queued);
        assert_eq!(victim.priority, Priority::Low);
        assert!(victim.worker_id.is_none());
        let checkpoint: Checkpoint =
            serde_json::from_str(victim.checkpoint.as_deref().unwrap()).unwrap();
        assert_eq!(checkpoint.preempted_by, critical);
        assert_eq!(checkpoint.payload_checksum, payload_checksum("payload of background-cleanup"));

        let kinds: Vec<String> = store
            .events_for_aggregate("task", low.as_str())
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&"PREEMPT_CHECKPOINT".to_string()));

        // The CRITICAL task claims next.
        let next = scheduler.claim(&worker, &ClaimFilter::default(), 130).unwrap().unwrap();
        assert_eq!(next.id, critical);
    }

    #[test]
    fn equal_or_lower_arrival_does_not_preempt() {
        let (_dir, store, scheduler) = scheduler();
        let worker = WorkerId::new("worker-1-1");

        let high = submit(&scheduler, "current", Priority::High, 100);
        scheduler.claim(&worker, &ClaimFilter::default(), 110).unwrap().unwrap();

        submit(&scheduler, "same-lane", Priority::High, 120);
        submit(&scheduler, "lower", Priority::Low, 121);

        let running = store.get_task(&high).unwrap();
        assert_eq!(running.state, TaskState::Running);
        assert!(running.checkpoint.is_none());
    }

    #[test]
    fn preemption_picks_the_lowest_priority_victim() {
        let (_dir, store, scheduler) = scheduler();
        let w1 = WorkerId::new("worker-1-1");
        let w2 = WorkerId::new("worker-2-1");

        let high = submit(&scheduler, "important", Priority::High, 100);
        let low = submit(&scheduler, "sweeper", Priority::Low, 101);
        scheduler.claim(&w1, &ClaimFilter::default(), 110).unwrap().unwrap();
        scheduler.claim(&w2, &ClaimFilter::default(), 111).unwrap().unwrap();

        submit(&scheduler, "urgent", Priority::Critical, 120);

        assert_eq!(store.get_task(&low).unwrap().state, TaskState::Queued);
        assert_eq!(store.get_task(&high).unwrap().state, TaskState::Running);
    }

    #[test]
    fn escalator_is_monotonic() {
        let (_dir, store, scheduler) = scheduler();
        let id = submit(&scheduler, "aging", Priority::Low, 1_000);
        let escalator = Escalator::from_config(&EscalationConfig::default());

        let mut last = Priority::Low;
        for t in [4_601, 6_402, 7_303, 20_000] {
            escalator.tick(&store, t).unwrap();
            let current = store.get_task(&id).unwrap().priority;
            assert!(current <= last, "priority must never decrease");
            last = current;
        }
        assert_eq!(last, Priority::Critical);
    }
}
