use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use rusqlite::{Connection, ErrorCode, TransactionBehavior};
use tracing::{debug, warn};

use triad_core::constants::{SQLITE_BUSY_TIMEOUT_MS, SQLITE_MAX_RETRIES, SQLITE_RETRY_DELAY_MS};
use triad_core::TriadError;

use crate::paths::{apply_permissions, validate_db_path};
use crate::schema;

/// Retry policy for busy/locked statements.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: SQLITE_MAX_RETRIES,
            initial_delay: Duration::from_millis(SQLITE_RETRY_DELAY_MS),
        }
    }
}

/// The store handle. One per process; cheap to share behind `Arc`.
///
/// A single connection behind a mutex is the write-serialization strategy:
/// WAL readers in other processes are fine, but within this process every
/// statement takes its turn, which removes the "database is locked" failure
/// mode between our own workers.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
    retry: RetryPolicy,
}

impl Store {
    /// Validate the path, open (or create) the database, apply pragmas,
    /// create the schema, and tighten file permissions.
    pub fn open(state_dir: &Path) -> Result<Self, TriadError> {
        Self::open_with_retry(state_dir, RetryPolicy::default())
    }

    pub fn open_with_retry(state_dir: &Path, retry: RetryPolicy) -> Result<Self, TriadError> {
        std::fs::create_dir_all(state_dir)?;
        let db_path = validate_db_path(state_dir)?;

        let conn = Connection::open(&db_path).map_err(sql_err)?;
        conn.busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS as u64))
            .map_err(sql_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(sql_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL").map_err(sql_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(sql_err)?;

        schema::init(&conn)?;
        apply_permissions(state_dir, &db_path)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: db_path,
            retry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with the connection, retrying busy/locked errors with
    /// exponential backoff + jitter. On budget exhaustion the caller gets
    /// `StoreUnavailable` and must not mutate other state.
    pub fn with_conn<T>(
        &self,
        mut f: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, TriadError> {
        let mut delay = self.retry.initial_delay;
        let mut attempt = 0u32;
        loop {
            let result = {
                let conn = self.conn.lock().expect("store mutex poisoned");
                f(&conn)
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                    let sleep = delay + Duration::from_millis(jitter);
                    warn!(attempt, sleep_ms = sleep.as_millis() as u64, "store busy, retrying");
                    std::thread::sleep(sleep);
                    delay = delay.saturating_mul(2);
                }
                Err(e) if is_busy(&e) => {
                    return Err(TriadError::StoreUnavailable {
                        attempts: attempt + 1,
                        detail: e.to_string(),
                    })
                }
                Err(e) => return Err(sql_err(e)),
            }
        }
    }

    /// Run `f` inside a BEGIN IMMEDIATE transaction with the same retry
    /// policy. IMMEDIATE takes the write lock up front so a conditional
    /// UPDATE's rows-changed count is authoritative.
    pub fn with_immediate_tx<T>(
        &self,
        mut f: impl FnMut(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> Result<T, TriadError> {
        let mut delay = self.retry.initial_delay;
        let mut attempt = 0u32;
        loop {
            let result = {
                let mut conn = self.conn.lock().expect("store mutex poisoned");
                conn.transaction_with_behavior(TransactionBehavior::Immediate)
                    .and_then(|tx| {
                        let out = f(&tx)?;
                        tx.commit()?;
                        Ok(out)
                    })
            };
            match result {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                    let sleep = delay + Duration::from_millis(jitter);
                    debug!(attempt, sleep_ms = sleep.as_millis() as u64, "tx busy, retrying");
                    std::thread::sleep(sleep);
                    delay = delay.saturating_mul(2);
                }
                Err(e) if is_busy(&e) => {
                    return Err(TriadError::StoreUnavailable {
                        attempts: attempt + 1,
                        detail: e.to_string(),
                    })
                }
                Err(e) => return Err(sql_err(e)),
            }
        }
    }

    // ── Health probes (used by the supervisor) ───────────────────────────────

    /// `PRAGMA integrity_check` returns "ok" on a healthy database.
    pub fn integrity_ok(&self) -> Result<bool, TriadError> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0))
        })
        .map(|s| s == "ok")
    }

    pub fn journal_mode(&self) -> Result<String, TriadError> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
        })
    }

    /// Idempotent WAL maintenance: re-enable WAL if missing, truncate the
    /// log, reclaim free pages. Never kills locking processes.
    pub fn wal_maintenance(&self) -> Result<(), TriadError> {
        self.with_conn(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            // wal_checkpoint returns a (busy, log, checkpointed) row.
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            conn.execute_batch("PRAGMA incremental_vacuum;")?;
            Ok(())
        })
    }
}

pub(crate) fn sql_err(e: rusqlite::Error) -> TriadError {
    TriadError::Sql(e.to_string())
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::DatabaseBusy || err.code == ErrorCode::DatabaseLocked
    )
}
