//! Schema DDL. Everything is `IF NOT EXISTS`; opening an existing database
//! is a no-op.

use rusqlite::Connection;

use triad_core::TriadError;

use crate::db::sql_err;

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    task_type        TEXT NOT NULL,
    priority         INTEGER NOT NULL CHECK (priority BETWEEN 0 AND 3),
    state            TEXT NOT NULL,
    lane             TEXT,
    shard            TEXT,
    assigned_model   TEXT,
    worker_id        TEXT,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    started_at       INTEGER,
    completed_at     INTEGER,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    max_retries      INTEGER NOT NULL DEFAULT 3,
    parent_task_id   TEXT,
    payload          TEXT NOT NULL,
    result           TEXT,
    error            TEXT,
    error_class      TEXT,
    priority_changed_at INTEGER NOT NULL,
    trace_id         TEXT NOT NULL,
    heartbeat_at     INTEGER,
    last_activity_at INTEGER,
    checksum         TEXT NOT NULL,
    checkpoint       TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_state    ON tasks(state);
CREATE INDEX IF NOT EXISTS idx_tasks_claim    ON tasks(state, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_worker   ON tasks(worker_id);
CREATE INDEX IF NOT EXISTS idx_tasks_type     ON tasks(task_type);

CREATE TABLE IF NOT EXISTS events (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    ts             INTEGER NOT NULL,
    aggregate_type TEXT NOT NULL,
    aggregate_id   TEXT NOT NULL,
    event_type     TEXT NOT NULL,
    payload        TEXT NOT NULL DEFAULT 'null',
    trace_id       TEXT NOT NULL,
    causation_id   TEXT,
    correlation_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_aggregate ON events(aggregate_type, aggregate_id);

CREATE TABLE IF NOT EXISTS workers (
    id              TEXT PRIMARY KEY,
    pid             INTEGER NOT NULL,
    status          TEXT NOT NULL,
    specialization  TEXT,
    shard           TEXT,
    model           TEXT,
    started_at      INTEGER NOT NULL,
    last_heartbeat  INTEGER NOT NULL,
    tasks_completed INTEGER NOT NULL DEFAULT 0,
    tasks_failed    INTEGER NOT NULL DEFAULT 0,
    crash_count     INTEGER NOT NULL DEFAULT 0,
    current_task    TEXT
);

CREATE TABLE IF NOT EXISTS worker_heartbeats (
    worker_id TEXT NOT NULL,
    ts        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_heartbeats_worker ON worker_heartbeats(worker_id, ts);

CREATE TABLE IF NOT EXISTS consensus_requests (
    id             TEXT PRIMARY KEY,
    task_id        TEXT NOT NULL,
    review_type    TEXT NOT NULL,
    subject        TEXT NOT NULL,
    context        TEXT NOT NULL,
    status         TEXT NOT NULL,
    final_decision TEXT,
    approvals      INTEGER NOT NULL DEFAULT 0,
    rejections     INTEGER NOT NULL DEFAULT 0,
    abstentions    INTEGER NOT NULL DEFAULT 0,
    created_at     INTEGER NOT NULL,
    updated_at     INTEGER NOT NULL,
    timeout_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_requests_task ON consensus_requests(task_id);

CREATE TABLE IF NOT EXISTS consensus_votes (
    request_id       TEXT NOT NULL,
    model            TEXT NOT NULL,
    decision         TEXT NOT NULL,
    confidence       REAL NOT NULL,
    reasoning        TEXT NOT NULL,
    required_changes TEXT,
    latency_ms       INTEGER,
    recorded_at      INTEGER NOT NULL,
    UNIQUE (request_id, model)
);

CREATE TABLE IF NOT EXISTS breakers (
    model           TEXT PRIMARY KEY,
    state           TEXT NOT NULL,
    failure_count   INTEGER NOT NULL DEFAULT 0,
    last_failure    INTEGER,
    last_success    INTEGER,
    half_open_calls INTEGER NOT NULL DEFAULT 0,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS costs (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    model         TEXT NOT NULL,
    input_tokens  INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    duration_ms   INTEGER NOT NULL,
    task_type     TEXT NOT NULL,
    ts            INTEGER NOT NULL,
    trace_id      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_costs_ts    ON costs(ts);
CREATE INDEX IF NOT EXISTS idx_costs_model ON costs(model, ts);

CREATE TABLE IF NOT EXISTS gates (
    task_id    TEXT NOT NULL,
    phase      TEXT NOT NULL,
    status     TEXT NOT NULL,
    approvals  INTEGER NOT NULL DEFAULT 0,
    rejections INTEGER NOT NULL DEFAULT 0,
    request_id TEXT,
    decided_at INTEGER,
    PRIMARY KEY (task_id, phase)
);

CREATE TABLE IF NOT EXISTS health_status (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ts          INTEGER NOT NULL,
    status      TEXT NOT NULL,
    snapshot    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_phases (
    task_id       TEXT NOT NULL,
    phase         TEXT NOT NULL,
    started_at    INTEGER NOT NULL,
    completed_at  INTEGER,
    gate_status   TEXT NOT NULL DEFAULT 'PENDING',
    gate_failures TEXT,
    gate_approvers TEXT,
    PRIMARY KEY (task_id, phase)
);

CREATE TABLE IF NOT EXISTS phase_artifacts (
    task_id     TEXT NOT NULL,
    phase       TEXT NOT NULL,
    name        TEXT NOT NULL,
    path        TEXT,
    recorded_at INTEGER NOT NULL,
    PRIMARY KEY (task_id, phase, name)
);

CREATE TABLE IF NOT EXISTS phase_gate_decisions (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    TEXT NOT NULL,
    phase      TEXT NOT NULL,
    request_id TEXT NOT NULL,
    decision   TEXT NOT NULL,
    decided_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS routing_decisions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     TEXT NOT NULL,
    review_type TEXT NOT NULL,
    roster      TEXT NOT NULL,
    decided_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS state (
    file_path TEXT NOT NULL,
    key       TEXT NOT NULL,
    value     TEXT NOT NULL,
    PRIMARY KEY (file_path, key)
);
"#;

pub fn init(conn: &Connection) -> Result<(), TriadError> {
    conn.execute_batch(DDL).map_err(sql_err)
}
