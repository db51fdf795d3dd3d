//! The self-healing supervisor.
//!
//! Every tick: run the idempotent recovery pass (WAL maintenance, cooled
//! breakers to HALF_OPEN, stale workers to dead, stranded tasks back to the
//! queue, cost-day rollover), then snapshot database/breaker/worker/queue/
//! cost health and persist it to `health.json` and the `health_status`
//! table. The supervisor repairs state; it never kills processes.

pub mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use triad_breakers::{BreakerSet, CostTracker};
use triad_core::constants::{HEALTH_FILE, QUEUE_DEPTH_WARN, TASK_STUCK_SECS, WORKER_STALE_SECS};
use triad_core::event::{EventKind, NewEvent};
use triad_core::task::Task;
use triad_core::types::{TaskState, Timestamp, TraceId};
use triad_core::TriadError;
use triad_store::Store;

pub use snapshot::{
    BreakerCheck, CostCheck, DatabaseCheck, HealthLevel, HealthSnapshot, QueueCheck, WorkerCheck,
};

pub struct Supervisor {
    store: Arc<Store>,
    breakers: Arc<BreakerSet>,
    cost: Arc<CostTracker>,
    health_path: PathBuf,
    worker_stale_secs: i64,
    task_stuck_secs: i64,
}

impl Supervisor {
    pub fn new(
        state_dir: &std::path::Path,
        store: Arc<Store>,
        breakers: Arc<BreakerSet>,
        cost: Arc<CostTracker>,
    ) -> Self {
        Self {
            store,
            breakers,
            cost,
            health_path: state_dir.join(HEALTH_FILE),
            worker_stale_secs: WORKER_STALE_SECS,
            task_stuck_secs: TASK_STUCK_SECS,
        }
    }

    pub fn with_thresholds(mut self, worker_stale_secs: i64, task_stuck_secs: i64) -> Self {
        self.worker_stale_secs = worker_stale_secs;
        self.task_stuck_secs = task_stuck_secs;
        self
    }

    /// One supervision cycle: heal, then report.
    pub fn tick(&self, now: Timestamp) -> Result<HealthSnapshot, TriadError> {
        let trace = TraceId::generate();

        self.heal_database();
        self.breakers.heal_cooled(now);
        self.heal_workers(&trace, now)?;
        self.heal_queue(&trace, now)?;
        self.cost.reset_if_new_day(now);

        let snapshot = self.snapshot(now)?;
        self.persist(&snapshot, &trace, now)?;
        Ok(snapshot)
    }

    /// Run forever on `interval_seconds`. Spawned as a background task by
    /// the node.
    pub async fn run(self: Arc<Self>, interval_seconds: u64) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let now = chrono::Utc::now().timestamp();
            match self.tick(now) {
                Ok(snapshot) => {
                    info!(overall = snapshot.overall.as_str(), "healing tick complete")
                }
                Err(e) => warn!(error = %e, "healing tick failed"),
            }
        }
    }

    // ── Healing actions ──────────────────────────────────────────────────────

    fn heal_database(&self) {
        // Never kills locking processes; WAL maintenance only.
        if let Err(e) = self.store.wal_maintenance() {
            warn!(error = %e, "WAL maintenance failed");
        }
    }

    fn heal_workers(&self, trace: &TraceId, now: Timestamp) -> Result<(), TriadError> {
        for worker in self.store.stale_workers(now, self.worker_stale_secs)? {
            warn!(worker = %worker.id, last_heartbeat = worker.last_heartbeat, "stale worker");
            let orphans = self.store.running_tasks_for_worker(&worker.id)?;
            self.store.mark_worker_dead(&worker.id, trace, now)?;
            for task in orphans {
                self.recover_task(&task, EventKind::RecoverStale, "dead worker", now)?;
            }
        }
        Ok(())
    }

    fn heal_queue(&self, trace: &TraceId, now: Timestamp) -> Result<(), TriadError> {
        // RUNNING past the stuck threshold.
        for task in self.store.running_started_before(now - self.task_stuck_secs)? {
            self.recover_task(&task, EventKind::RecoverStuck, "stuck past wall clock", now)?;
        }
        // FAILED but retryable: the retry counter was already charged when
        // the failure was recorded, so this requeue does not charge again.
        for task in self.store.failed_retryable()? {
            self.store
                .transition_task(&task.id, TaskState::Queued, "retryable failure requeued", "healer", now)?;
            self.store.append_event(
                &NewEvent::task(task.id.as_str(), EventKind::RecoverStuck, trace.clone())
                    .with_payload(serde_json::json!({ "from": "FAILED" })),
                now,
            )?;
        }
        Ok(())
    }

    /// RUNNING → TIMEOUT → (QUEUED with retry += 1, or ESCALATED past the
    /// cap). Each hop is an audited matrix edge.
    fn recover_task(
        &self,
        task: &Task,
        kind: EventKind,
        reason: &str,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        match self
            .store
            .transition_task(&task.id, TaskState::Timeout, reason, "healer", now)
        {
            Ok(()) => {}
            // Someone else moved it first; recovery is idempotent.
            Err(TriadError::TransitionConflict { .. }) | Err(TriadError::InvalidTransition { .. }) => {
                return Ok(())
            }
            Err(e) => return Err(e),
        }
        let new_state = self
            .store
            .requeue_or_escalate(&task.id, reason, "healer", now)?;
        self.store.append_event(
            &NewEvent::task(task.id.as_str(), kind, task.trace_id.clone()).with_payload(
                serde_json::json!({
                    "reason": reason,
                    "worker": task.worker_id.as_ref().map(|w| w.as_str().to_string()),
                    "recovered_to": new_state.as_str(),
                }),
            ),
            now,
        )?;
        info!(task_id = %task.id, to = %new_state, reason, "recovered task");
        Ok(())
    }

    // ── Snapshot ─────────────────────────────────────────────────────────────

    fn snapshot(&self, now: Timestamp) -> Result<HealthSnapshot, TriadError> {
        let database = self.check_database();
        let breakers = self.check_breakers();
        let workers = self.check_workers(now)?;
        let queue = self.check_queue(now)?;
        let cost = self.check_cost(now)?;

        let overall = HealthSnapshot::roll_up([
            database.level,
            breakers.level,
            workers.level,
            queue.level,
            cost.level,
        ]);
        Ok(HealthSnapshot {
            ts: now,
            overall,
            database,
            breakers,
            workers,
            queue,
            cost,
        })
    }

    fn check_database(&self) -> DatabaseCheck {
        let present = self.store.path().exists();
        let integrity_ok = self.store.integrity_ok().unwrap_or(false);
        let wal_mode = self
            .store
            .journal_mode()
            .map(|m| m.eq_ignore_ascii_case("wal"))
            .unwrap_or(false);
        let level = if !present || !integrity_ok {
            HealthLevel::Critical
        } else if !wal_mode {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        };
        DatabaseCheck {
            present,
            integrity_ok,
            wal_mode,
            level,
        }
    }

    fn check_breakers(&self) -> BreakerCheck {
        let open: Vec<String> = self
            .breakers
            .open_models()
            .into_iter()
            .map(|m| m.to_string())
            .collect();
        let tracked = self.breakers.tracked_models().len();
        let level = if open.is_empty() {
            HealthLevel::Healthy
        } else if tracked > 0 && open.len() == tracked {
            HealthLevel::Critical
        } else {
            HealthLevel::Degraded
        };
        BreakerCheck {
            open_models: open,
            tracked_models: tracked,
            level,
        }
    }

    fn check_workers(&self, now: Timestamp) -> Result<WorkerCheck, TriadError> {
        let active = self.store.active_worker_count()?;
        let stale: Vec<String> = self
            .store
            .stale_workers(now, self.worker_stale_secs)?
            .into_iter()
            .map(|w| w.id.to_string())
            .collect();
        let level = if stale.is_empty() {
            HealthLevel::Healthy
        } else if active == 0 {
            HealthLevel::Critical
        } else {
            HealthLevel::Degraded
        };
        Ok(WorkerCheck {
            active,
            stale,
            level,
        })
    }

    fn check_queue(&self, now: Timestamp) -> Result<QueueCheck, TriadError> {
        let depth = self.store.queue_depth()?;
        let stuck = self
            .store
            .running_started_before(now - self.task_stuck_secs)?
            .len() as u64;
        let failed_retryable = self.store.failed_retryable()?.len() as u64;
        let level = if stuck == 0 && depth < QUEUE_DEPTH_WARN {
            HealthLevel::Healthy
        } else {
            HealthLevel::Degraded
        };
        Ok(QueueCheck {
            depth,
            stuck,
            failed_retryable,
            level,
        })
    }

    fn check_cost(&self, now: Timestamp) -> Result<CostCheck, TriadError> {
        let paused = self.cost.is_open(now);
        let daily_spend_usd = if self.cost.enabled() {
            self.cost.daily_spend(now)?
        } else {
            0.0
        };
        Ok(CostCheck {
            daily_spend_usd,
            budget_usd: self.cost.enabled().then(|| self.cost.budget_usd()),
            paused,
            level: if paused {
                HealthLevel::Degraded
            } else {
                HealthLevel::Healthy
            },
        })
    }

    fn persist(
        &self,
        snapshot: &HealthSnapshot,
        trace: &TraceId,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| TriadError::Serialization(e.to_string()))?;
        std::fs::write(&self.health_path, &json)?;
        self.store
            .record_health(snapshot.overall.as_str(), &json, now)?;
        self.store.append_event(
            &NewEvent::system(EventKind::HealingTick, trace.clone())
                .with_payload(serde_json::json!({ "overall": snapshot.overall.as_str() })),
            now,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triad_config::CostLimits;
    use triad_core::task::{NewTask, Worker, WorkerStatus};
    use triad_core::types::{Priority, WorkerId};
    use triad_locks::LockManager;
    use triad_store::tasks::ClaimFilter;

    fn setup(dir: &std::path::Path) -> (Arc<Store>, Supervisor) {
        let store = Arc::new(Store::open(dir).unwrap());
        let breakers = Arc::new(BreakerSet::new(dir, Arc::clone(&store), 5, 120).unwrap());
        let cost = Arc::new(
            CostTracker::new(dir, Arc::clone(&store), LockManager::default(), CostLimits::default())
                .unwrap(),
        );
        let supervisor = Supervisor::new(dir, Arc::clone(&store), breakers, cost);
        (store, supervisor)
    }

    fn busy_worker(id: &str, heartbeat: i64) -> Worker {
        Worker {
            id: WorkerId::new(id),
            pid: 777,
            status: WorkerStatus::Busy,
            specialization: None,
            shard: None,
            model: None,
            started_at: heartbeat,
            last_heartbeat: heartbeat,
            tasks_completed: 0,
            tasks_failed: 0,
            crash_count: 0,
            current_task: None,
        }
    }

    #[test]
    fn stale_worker_task_is_recovered_in_one_tick() {
        let dir = tempfile::tempdir().unwrap();
        let (store, supervisor) = setup(dir.path());
        let trace = TraceId::generate();

        // A busy worker claims a task, then stops heartbeating.
        let worker = busy_worker("worker-1-1", 1_000);
        store.register_worker(&worker, &trace).unwrap();
        let task = NewTask::new("orphaned", "IMPLEMENTATION", Priority::High, "x")
            .into_task(1_000, TraceId::generate());
        let id = task.id.clone();
        store.insert_task(&task).unwrap();
        store.claim_task(&worker.id, &ClaimFilter::default(), 1_001).unwrap().unwrap();

        // 31 minutes later, one healing tick.
        let now = 1_000 + 31 * 60;
        supervisor.tick(now).unwrap();

        let recovered = store.get_task(&id).unwrap();
        assert_eq!(recovered.state, TaskState::Queued);
        assert_eq!(recovered.retry_count, 1);
        assert!(recovered.worker_id.is_none());

        let kinds: Vec<String> = store
            .events_for_aggregate("task", id.as_str())
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&"RECOVER_STALE".to_string()));

        let dead = store.get_worker(&worker.id).unwrap().unwrap();
        assert_eq!(dead.status, WorkerStatus::Dead);
    }

    #[test]
    fn stuck_running_task_requeues_with_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (store, supervisor) = setup(dir.path());
        let trace = TraceId::generate();

        let worker = busy_worker("worker-1-1", 1_000);
        store.register_worker(&worker, &trace).unwrap();
        let task = NewTask::new("slow", "IMPLEMENTATION", Priority::Low, "x")
            .into_task(1_000, TraceId::generate());
        let id = task.id.clone();
        store.insert_task(&task).unwrap();
        store.claim_task(&worker.id, &ClaimFilter::default(), 1_000).unwrap().unwrap();

        // Keep the worker fresh so only the stuck-task sweep fires.
        let now = 1_000 + 2 * 3_600 + 1;
        store
            .heartbeat_worker(&worker.id, Some(&id), WorkerStatus::Busy, now - 10)
            .unwrap();
        supervisor.tick(now).unwrap();

        let recovered = store.get_task(&id).unwrap();
        assert_eq!(recovered.state, TaskState::Queued);
        assert_eq!(recovered.retry_count, 1);
    }

    #[test]
    fn recovery_escalates_past_retry_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (store, supervisor) = setup(dir.path());
        let trace = TraceId::generate();

        let worker = busy_worker("worker-1-1", 1_000);
        store.register_worker(&worker, &trace).unwrap();
        let mut nt = NewTask::new("doomed", "IMPLEMENTATION", Priority::Low, "x");
        nt.max_retries = Some(1);
        let task = nt.into_task(1_000, TraceId::generate());
        let id = task.id.clone();
        store.insert_task(&task).unwrap();
        store.claim_task(&worker.id, &ClaimFilter::default(), 1_000).unwrap().unwrap();

        supervisor.tick(1_000 + 31 * 60).unwrap();
        assert_eq!(store.get_task(&id).unwrap().state, TaskState::Escalated);
    }

    #[test]
    fn snapshot_reports_healthy_on_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, supervisor) = setup(dir.path());
        let snapshot = supervisor.tick(1_000).unwrap();
        assert_eq!(snapshot.overall, HealthLevel::Healthy);
        assert!(snapshot.database.wal_mode);
        assert!(snapshot.database.integrity_ok);

        let health_file = dir.path().join(HEALTH_FILE);
        let parsed: HealthSnapshot =
            serde_json::from_str(&std::fs::read_to_string(health_file).unwrap()).unwrap();
        assert_eq!(parsed.overall, HealthLevel::Healthy);
    }

    #[test]
    fn open_breaker_degrades_health() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let breakers = Arc::new(BreakerSet::new(dir.path(), Arc::clone(&store), 5, 10_000).unwrap());
        let cost = Arc::new(
            CostTracker::new(dir.path(), Arc::clone(&store), LockManager::default(), CostLimits::default())
                .unwrap(),
        );
        for i in 0..5 {
            breakers.record_failure(&triad_core::types::ModelId::new("codex"), false, 100 + i);
        }
        let supervisor = Supervisor::new(dir.path(), store, breakers, cost);
        let snapshot = supervisor.tick(200).unwrap();
        assert_eq!(snapshot.breakers.level, HealthLevel::Critical);
        assert_eq!(snapshot.breakers.open_models, vec!["codex"]);
    }

    #[test]
    fn healing_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (store, supervisor) = setup(dir.path());
        let trace = TraceId::generate();

        let worker = busy_worker("worker-1-1", 1_000);
        store.register_worker(&worker, &trace).unwrap();
        let task = NewTask::new("orphaned", "IMPLEMENTATION", Priority::High, "x")
            .into_task(1_000, TraceId::generate());
        let id = task.id.clone();
        store.insert_task(&task).unwrap();
        store.claim_task(&worker.id, &ClaimFilter::default(), 1_001).unwrap().unwrap();

        let now = 1_000 + 31 * 60;
        supervisor.tick(now).unwrap();
        supervisor.tick(now + 60).unwrap();

        // Second tick changed nothing further.
        let recovered = store.get_task(&id).unwrap();
        assert_eq!(recovered.state, TaskState::Queued);
        assert_eq!(recovered.retry_count, 1);
    }
}
