//! Per-delegate circuit breakers.
//!
//! CLOSED admits everything and counts consecutive failures. At the failure
//! threshold — or on a single catastrophic failure — the breaker opens and
//! rejects without touching the network. After the cooldown it admits
//! exactly one probe at a time in HALF_OPEN; a successful probe closes the
//! breaker and resets the counter, a failed one re-opens it and restarts
//! the cooldown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use triad_core::constants::BREAKER_HALF_OPEN_MAX_CALLS;
use triad_core::event::{EventKind, NewEvent};
use triad_core::types::{BreakerState, ModelId, Timestamp, TraceId};
use triad_core::TriadError;
use triad_store::breakers::BreakerRow;
use triad_store::Store;

/// Outcome of `try_acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker CLOSED: normal call.
    Allowed,
    /// Breaker HALF_OPEN: this call is the probe. The caller must report
    /// success or failure, which releases the probe slot.
    Probe,
}

#[derive(Debug, Clone)]
struct BreakerCore {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Timestamp>,
    last_success: Option<Timestamp>,
    half_open_calls: u32,
    probe_in_flight: bool,
}

impl Default for BreakerCore {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
            last_success: None,
            half_open_calls: 0,
            probe_in_flight: false,
        }
    }
}

/// All breakers for the roster, persisted under `<state_dir>/breakers/`.
pub struct BreakerSet {
    dir: PathBuf,
    store: Arc<Store>,
    failure_threshold: u32,
    cooldown_secs: i64,
    inner: Mutex<HashMap<ModelId, BreakerCore>>,
}

impl BreakerSet {
    pub fn new(
        state_dir: &std::path::Path,
        store: Arc<Store>,
        failure_threshold: u32,
        cooldown_secs: i64,
    ) -> Result<Self, TriadError> {
        let dir = state_dir.join(triad_core::constants::BREAKERS_DIR);
        std::fs::create_dir_all(&dir)?;
        let set = Self {
            dir,
            store,
            failure_threshold,
            cooldown_secs,
            inner: Mutex::new(HashMap::new()),
        };
        set.load_existing()?;
        Ok(set)
    }

    /// Gate an outbound call. Errors with `BreakerOpen` when the model is
    /// unavailable; otherwise tells the caller whether this is a probe.
    pub fn try_acquire(&self, model: &ModelId, now: Timestamp) -> Result<Admission, TriadError> {
        let mut inner = self.inner.lock().expect("breaker set poisoned");
        let core = inner.entry(model.clone()).or_default();

        match core.state {
            BreakerState::Closed => Ok(Admission::Allowed),
            BreakerState::Open => {
                let cooled = core
                    .last_failure
                    .map(|t| now - t >= self.cooldown_secs)
                    .unwrap_or(true);
                if !cooled {
                    return Err(TriadError::BreakerOpen {
                        model: model.to_string(),
                    });
                }
                core.state = BreakerState::HalfOpen;
                core.half_open_calls = 1;
                core.probe_in_flight = true;
                let snapshot = core.clone();
                drop(inner);
                self.persist(model, &snapshot, EventKind::BreakerHalfOpen, now);
                info!(model = %model, "breaker half-open, admitting probe");
                Ok(Admission::Probe)
            }
            BreakerState::HalfOpen => {
                if core.probe_in_flight || core.half_open_calls >= BREAKER_HALF_OPEN_MAX_CALLS {
                    return Err(TriadError::BreakerOpen {
                        model: model.to_string(),
                    });
                }
                core.half_open_calls += 1;
                core.probe_in_flight = true;
                Ok(Admission::Probe)
            }
        }
    }

    /// Report a successful call.
    pub fn record_success(&self, model: &ModelId, now: Timestamp) {
        let mut inner = self.inner.lock().expect("breaker set poisoned");
        let core = inner.entry(model.clone()).or_default();
        core.last_success = Some(now);
        core.probe_in_flight = false;
        let reopened = core.state != BreakerState::Closed;
        if reopened {
            core.state = BreakerState::Closed;
            core.failure_count = 0;
            core.half_open_calls = 0;
        } else {
            core.failure_count = 0;
        }
        let snapshot = core.clone();
        drop(inner);
        if reopened {
            self.persist(model, &snapshot, EventKind::BreakerClosed, now);
            info!(model = %model, "breaker closed");
        } else {
            self.persist_quiet(model, &snapshot, now);
        }
    }

    /// Report a failed call. `catastrophic` failures (auth, 5xx storm) trip
    /// a CLOSED breaker immediately.
    pub fn record_failure(&self, model: &ModelId, catastrophic: bool, now: Timestamp) {
        let mut inner = self.inner.lock().expect("breaker set poisoned");
        let core = inner.entry(model.clone()).or_default();
        core.last_failure = Some(now);
        core.probe_in_flight = false;

        let opened = match core.state {
            BreakerState::Closed => {
                core.failure_count += 1;
                if core.failure_count >= self.failure_threshold || catastrophic {
                    core.state = BreakerState::Open;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                // Failed probe: back to OPEN, cooldown restarts from now.
                core.state = BreakerState::Open;
                core.half_open_calls = 0;
                true
            }
            BreakerState::Open => false,
        };
        let snapshot = core.clone();
        drop(inner);

        if opened {
            self.persist(model, &snapshot, EventKind::BreakerOpened, now);
            warn!(
                model = %model,
                failures = snapshot.failure_count,
                catastrophic,
                "breaker opened"
            );
        } else {
            self.persist_quiet(model, &snapshot, now);
        }
    }

    /// Release a probe slot without recording an outcome. Used when a call
    /// was admitted but failed in a way that says nothing about the
    /// delegate's transport health (e.g. a schema violation).
    pub fn release_probe(&self, model: &ModelId) {
        let mut inner = self.inner.lock().expect("breaker set poisoned");
        if let Some(core) = inner.get_mut(model) {
            if core.probe_in_flight {
                core.probe_in_flight = false;
                core.half_open_calls = core.half_open_calls.saturating_sub(1);
            }
        }
    }

    pub fn state_of(&self, model: &ModelId) -> BreakerState {
        self.inner
            .lock()
            .expect("breaker set poisoned")
            .get(model)
            .map(|c| c.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Models with OPEN breakers (for the health snapshot).
    pub fn open_models(&self) -> Vec<ModelId> {
        self.inner
            .lock()
            .expect("breaker set poisoned")
            .iter()
            .filter(|(_, c)| c.state == BreakerState::Open)
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn tracked_models(&self) -> Vec<ModelId> {
        self.inner
            .lock()
            .expect("breaker set poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Healing action: any OPEN breaker whose cooldown has elapsed moves to
    /// HALF_OPEN (without consuming the probe slot). Idempotent.
    pub fn heal_cooled(&self, now: Timestamp) -> Vec<ModelId> {
        let mut healed = Vec::new();
        let mut snapshots = Vec::new();
        {
            let mut inner = self.inner.lock().expect("breaker set poisoned");
            for (model, core) in inner.iter_mut() {
                if core.state == BreakerState::Open {
                    let cooled = core
                        .last_failure
                        .map(|t| now - t >= self.cooldown_secs)
                        .unwrap_or(true);
                    if cooled {
                        core.state = BreakerState::HalfOpen;
                        core.half_open_calls = 0;
                        core.probe_in_flight = false;
                        healed.push(model.clone());
                        snapshots.push((model.clone(), core.clone()));
                    }
                }
            }
        }
        for (model, snapshot) in snapshots {
            self.persist(&model, &snapshot, EventKind::BreakerHalfOpen, now);
            info!(model = %model, "breaker cooled to half-open");
        }
        healed
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    fn state_file(&self, model: &ModelId) -> PathBuf {
        self.dir.join(format!("{model}.state"))
    }

    fn load_existing(&self) -> Result<(), TriadError> {
        let mut inner = self.inner.lock().expect("breaker set poisoned");
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(model) = name.strip_suffix(".state") else {
                continue;
            };
            if model == "cost" {
                continue;
            }
            let text = std::fs::read_to_string(entry.path())?;
            if let Some(core) = parse_state_file(&text) {
                inner.insert(ModelId::new(model), core);
            } else {
                warn!(file = %entry.path().display(), "unreadable breaker state, starting CLOSED");
            }
        }
        Ok(())
    }

    fn persist(&self, model: &ModelId, core: &BreakerCore, kind: EventKind, now: Timestamp) {
        self.persist_quiet(model, core, now);
        let ev = NewEvent {
            aggregate_type: "breaker".into(),
            aggregate_id: model.to_string(),
            kind,
            payload: serde_json::json!({
                "state": core.state.as_str(),
                "failure_count": core.failure_count,
            }),
            trace_id: TraceId::generate(),
            causation_id: None,
            correlation_id: None,
        };
        if let Err(e) = self.store.append_event(&ev, now) {
            warn!(model = %model, error = %e, "failed to append breaker event");
        }
    }

    fn persist_quiet(&self, model: &ModelId, core: &BreakerCore, now: Timestamp) {
        let text = render_state_file(core);
        if let Err(e) = std::fs::write(self.state_file(model), text) {
            warn!(model = %model, error = %e, "failed to persist breaker state file");
        }
        let row = BreakerRow {
            model: model.clone(),
            state: core.state,
            failure_count: core.failure_count,
            last_failure: core.last_failure,
            last_success: core.last_success,
            half_open_calls: core.half_open_calls,
        };
        if let Err(e) = self.store.upsert_breaker_row(&row, now) {
            warn!(model = %model, error = %e, "failed to mirror breaker row");
        }
    }
}

fn render_state_file(core: &BreakerCore) -> String {
    format!(
        "state={}\nfailure_count={}\nlast_failure={}\nlast_success={}\nhalf_open_calls={}\n",
        core.state.as_str(),
        core.failure_count,
        core.last_failure.unwrap_or(0),
        core.last_success.unwrap_or(0),
        core.half_open_calls,
    )
}

fn parse_state_file(text: &str) -> Option<BreakerCore> {
    let mut core = BreakerCore::default();
    for line in text.lines() {
        let (key, value) = line.split_once('=')?;
        match key {
            "state" => core.state = BreakerState::parse(value).ok()?,
            "failure_count" => core.failure_count = value.parse().ok()?,
            "last_failure" => {
                let v: i64 = value.parse().ok()?;
                core.last_failure = (v != 0).then_some(v);
            }
            "last_success" => {
                let v: i64 = value.parse().ok()?;
                core.last_success = (v != 0).then_some(v);
            }
            "half_open_calls" => core.half_open_calls = value.parse().ok()?,
            _ => {}
        }
    }
    Some(core)
}
