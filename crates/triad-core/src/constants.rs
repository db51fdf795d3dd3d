//! ─── Triad kernel defaults ──────────────────────────────────────────────────
//!
//! Every value here is a default; the YAML configuration surface and its
//! environment-variable mirrors override them at boot (see triad-config).

// ── Store ────────────────────────────────────────────────────────────────────

/// Database file name inside the state directory.
pub const DB_FILE_NAME: &str = "tri-agent.db";

/// SQLite busy timeout (milliseconds).
pub const SQLITE_BUSY_TIMEOUT_MS: u32 = 10_000;

/// Retry budget for statements that return busy/locked.
pub const SQLITE_MAX_RETRIES: u32 = 10;

/// Initial backoff before the first retry (milliseconds). Doubles with
/// jitter on each attempt.
pub const SQLITE_RETRY_DELAY_MS: u64 = 200;

// ── Locks ────────────────────────────────────────────────────────────────────

/// Initial contention backoff (seconds).
pub const LOCK_BACKOFF_INITIAL_SECS: u64 = 1;

/// Backoff ceiling (seconds).
pub const LOCK_BACKOFF_MAX_SECS: u64 = 8;

/// Default total acquisition timeout (seconds).
pub const LOCK_ACQUIRE_TIMEOUT_SECS: u64 = 60;

/// Age at which a lock is a stale auto-release candidate (seconds).
pub const LOCK_STALE_TIMEOUT_SECS: i64 = 300;

/// Age at which a held lock with a live owner triggers the deadlock
/// warning heuristic (seconds).
pub const LOCK_DEADLOCK_WARN_SECS: i64 = 120;

/// Bounded size of the in-memory lock metrics ring.
pub const LOCK_METRICS_RING_CAPACITY: usize = 256;

// ── Scheduling ───────────────────────────────────────────────────────────────

/// LOW tasks promote to MEDIUM after waiting this long (seconds).
pub const ESCALATE_LOW_AFTER_SECS: i64 = 3_600;

/// MEDIUM tasks promote to HIGH after waiting this long (seconds).
pub const ESCALATE_MEDIUM_AFTER_SECS: i64 = 1_800;

/// HIGH tasks promote to CRITICAL after waiting this long (seconds).
pub const ESCALATE_HIGH_AFTER_SECS: i64 = 900;

/// Default retry cap per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Characters of payload preserved in a preemption checkpoint preview.
pub const CHECKPOINT_PREVIEW_CHARS: usize = 160;

// ── Circuit breaker ──────────────────────────────────────────────────────────

/// Consecutive failures before a CLOSED breaker opens.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Cooldown before an OPEN breaker admits a probe (seconds).
pub const BREAKER_COOLDOWN_SECS: i64 = 120;

/// Maximum probes admitted while HALF_OPEN (at most one in flight).
pub const BREAKER_HALF_OPEN_MAX_CALLS: u32 = 1;

// ── Cost breaker ─────────────────────────────────────────────────────────────

/// Fraction of the daily budget held back as safety margin.
pub const COST_MARGIN_PCT: f64 = 0.15;

/// Flat reserve added to every projection (USD).
pub const COST_RESERVE_USD: f64 = 1.0;

// ── Consensus ────────────────────────────────────────────────────────────────

/// Approvals required for a final APPROVE.
pub const CONSENSUS_APPROVAL_THRESHOLD: u32 = 2;

/// APPROVE votes below this confidence are downgraded to ABSTAIN.
pub const CONSENSUS_MIN_CONFIDENCE: f64 = 0.7;

/// Recorded on REJECT votes; does not currently change aggregation.
pub const CONSENSUS_REJECT_CONFIDENCE: f64 = 0.9;

/// Fan-out wait ceiling (seconds). Missing votes become ABSTAIN.
pub const CONSENSUS_TIMEOUT_SECS: u64 = 300;

// ── Workers / healing ────────────────────────────────────────────────────────

/// A busy worker with no heartbeat for this long is stale (seconds).
pub const WORKER_STALE_SECS: i64 = 30 * 60;

/// A RUNNING task older than this is stuck (seconds).
pub const TASK_STUCK_SECS: i64 = 2 * 3_600;

/// Supervisor tick interval (seconds).
pub const HEALING_INTERVAL_SECS: u64 = 60;

/// Queue depth above which the queue subcheck reports degraded.
pub const QUEUE_DEPTH_WARN: u64 = 100;

/// Default per-task wall clock (seconds).
pub const TASK_WALL_CLOCK_SECS: i64 = 3_600;

// ── Delegate calls ───────────────────────────────────────────────────────────

/// Default per-call delegate timeout (seconds).
pub const DELEGATE_TIMEOUT_SECS: u64 = 120;

/// Default max concurrent in-flight calls per delegate.
pub const DELEGATE_MAX_CONCURRENT: u32 = 2;

// ── Rate limits ──────────────────────────────────────────────────────────────

/// Default token-bucket capacity per delegate.
pub const RATE_BUCKET_CAPACITY: f64 = 30.0;

/// Default token-bucket refill rate (tokens per second).
pub const RATE_REFILL_PER_SEC: f64 = 0.5;

// ── State directory layout ───────────────────────────────────────────────────

pub const LOCKS_DIR: &str = "locks";
pub const BREAKERS_DIR: &str = "breakers";
pub const RATE_LIMITS_DIR: &str = "rate-limits";
pub const COSTS_DIR: &str = "costs";
pub const HEALTH_FILE: &str = "health.json";
pub const BASELINE_FILE: &str = "binary-hashes.baseline";

// ── Key-value state keys ─────────────────────────────────────────────────────

/// Global pause flag: claims return none while set. Running tasks are
/// never killed by a pause.
pub const KV_PAUSED: &str = "paused";

/// Reason the pause flag was last set (operator, budget_guardrail).
pub const KV_PAUSE_REASON: &str = "pause_reason";
