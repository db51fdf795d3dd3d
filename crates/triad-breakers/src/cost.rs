//! The daily cost breaker and the cost ledger.
//!
//! Before every outbound call: projected = today's spend + the call's
//! estimate + the reserve. If projected >= budget · (1 − margin) the cost
//! breaker opens for the rest of the UTC day, the global pause flag is set
//! with reason `budget_guardrail`, and the call is refused. The breaker
//! resets itself at the next day boundary.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use triad_config::CostLimits;
use triad_core::cost::{call_cost_usd, CostRecord};
use triad_core::event::{EventKind, NewEvent};
use triad_core::types::{ModelId, Timestamp, TraceId};
use triad_core::TriadError;
use triad_locks::{LockManager, LockMode};
use triad_store::Store;

const COST_STATE_FILE: &str = "cost.state";
const LEDGER_LOCK: &str = "costs.lock";

pub struct CostTracker {
    breakers_dir: PathBuf,
    costs_dir: PathBuf,
    locks_dir: PathBuf,
    store: Arc<Store>,
    locks: LockManager,
    limits: CostLimits,
}

/// Per-day ledger JSON (`costs/daily_YYYY-MM-DD.json`).
#[derive(Debug, Default, Serialize, Deserialize)]
struct DailyLedger {
    #[serde(default)]
    total_usd: f64,
    #[serde(default)]
    models: std::collections::BTreeMap<String, LedgerEntry>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
    calls: u64,
}

impl CostTracker {
    pub fn new(
        state_dir: &std::path::Path,
        store: Arc<Store>,
        locks: LockManager,
        limits: CostLimits,
    ) -> Result<Self, TriadError> {
        let breakers_dir = state_dir.join(triad_core::constants::BREAKERS_DIR);
        let costs_dir = state_dir.join(triad_core::constants::COSTS_DIR);
        let locks_dir = state_dir.join(triad_core::constants::LOCKS_DIR);
        std::fs::create_dir_all(&breakers_dir)?;
        std::fs::create_dir_all(&costs_dir)?;
        std::fs::create_dir_all(&locks_dir)?;
        Ok(Self {
            breakers_dir,
            costs_dir,
            locks_dir,
            store,
            locks,
            limits,
        })
    }

    pub fn enabled(&self) -> bool {
        self.limits.enabled && self.limits.daily_budget_usd > 0.0
    }

    pub fn budget_usd(&self) -> f64 {
        self.limits.daily_budget_usd
    }

    /// USD estimate for a call with the configured per-1k rates.
    pub fn estimate(&self, model: &ModelId, input_tokens: u64, output_tokens: u64) -> f64 {
        let rates = self.limits.per_1k_tokens.get(model.as_str());
        let (rin, rout) = rates.map(|r| (r.input, r.output)).unwrap_or((0.0, 0.0));
        call_cost_usd(input_tokens, output_tokens, rin, rout)
    }

    /// Spend so far in the UTC day containing `now`.
    pub fn daily_spend(&self, now: Timestamp) -> Result<f64, TriadError> {
        let (day_start, day_end) = day_window(now);
        let totals = self.store.tokens_for_window(day_start, day_end)?;
        Ok(totals
            .iter()
            .map(|t| self.estimate(&t.model, t.input_tokens, t.output_tokens))
            .sum())
    }

    /// Gate an outbound call. `Ok(())` admits it.
    pub fn check(
        &self,
        model: &ModelId,
        est_input_tokens: u64,
        est_output_tokens: u64,
        trace: &TraceId,
        now: Timestamp,
    ) -> Result<(), TriadError> {
        if !self.enabled() {
            return Ok(());
        }

        let today = day_string(now);

        // A previous trip today still holds; a trip from yesterday resets.
        if let Some(state) = self.read_state() {
            if state.state == "OPEN" {
                if state.day == today {
                    return Err(TriadError::BudgetExhausted {
                        projected_usd: state.projected_usd,
                        threshold_usd: state.threshold_usd,
                    });
                }
                self.reset(now);
            }
        }

        let spend = self.daily_spend(now)?;
        let estimate = self.estimate(model, est_input_tokens, est_output_tokens);
        let projected = spend + estimate + self.limits.reserve_usd;
        let threshold = self.limits.daily_budget_usd * (1.0 - self.limits.margin_pct);

        if projected >= threshold {
            self.trip(projected, threshold, &today, trace, now);
            return Err(TriadError::BudgetExhausted {
                projected_usd: projected,
                threshold_usd: threshold,
            });
        }
        Ok(())
    }

    /// Record a completed call: SQL row plus the lock-protected JSON ledgers.
    pub fn record(&self, rec: &CostRecord) -> Result<(), TriadError> {
        self.store.record_cost(rec)?;

        let cost = self.estimate(&rec.model, rec.input_tokens, rec.output_tokens);
        let lock_path = self.locks_dir.join(LEDGER_LOCK);
        let _guard = self
            .locks
            .acquire(&lock_path, LockMode::Exclusive, &rec.trace_id)?;

        self.update_ledger(
            &self.costs_dir.join(format!("daily_{}.json", day_string(rec.ts))),
            rec,
            cost,
        )?;
        self.update_ledger(
            &self.costs_dir.join(format!("model_{}.json", rec.model)),
            rec,
            cost,
        )?;
        self.update_ledger(&self.costs_dir.join("totals.json"), rec, cost)?;
        Ok(())
    }

    /// Whether the cost breaker is currently open.
    pub fn is_open(&self, now: Timestamp) -> bool {
        self.read_state()
            .map(|s| s.state == "OPEN" && s.day == day_string(now))
            .unwrap_or(false)
    }

    /// Day-boundary reset plus pause-flag cleanup. Called by check() lazily
    /// and by the supervisor tick.
    pub fn reset_if_new_day(&self, now: Timestamp) {
        if let Some(state) = self.read_state() {
            if state.state == "OPEN" && state.day != day_string(now) {
                self.reset(now);
            }
        }
    }

    fn trip(&self, projected: f64, threshold: f64, day: &str, trace: &TraceId, now: Timestamp) {
        let state = CostState {
            state: "OPEN".into(),
            day: day.to_string(),
            reason: "budget_guardrail".into(),
            projected_usd: projected,
            threshold_usd: threshold,
        };
        self.write_state(&state);

        if let Err(e) = self.store.set_paused("budget_guardrail") {
            warn!(error = %e, "failed to set pause flag on budget trip");
        }
        let ev = NewEvent::system(EventKind::CostRefused, trace.clone()).with_payload(
            serde_json::json!({
                "projected_usd": projected,
                "threshold_usd": threshold,
                "reason": "budget_guardrail",
            }),
        );
        if let Err(e) = self.store.append_event(&ev, now) {
            warn!(error = %e, "failed to append cost event");
        }
        warn!(projected, threshold, "cost breaker opened (budget_guardrail)");
    }

    fn reset(&self, _now: Timestamp) {
        let _ = std::fs::remove_file(self.breakers_dir.join(COST_STATE_FILE));
        // Only clear a pause this breaker caused; an operator pause stays.
        if let Ok(Some(reason)) = self.store.pause_reason() {
            if reason == "budget_guardrail" {
                let _ = self.store.clear_paused();
            }
        }
        info!("cost breaker reset at day boundary");
    }

    fn update_ledger(
        &self,
        path: &std::path::Path,
        rec: &CostRecord,
        cost: f64,
    ) -> Result<(), TriadError> {
        let mut ledger: DailyLedger = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => DailyLedger::default(),
        };
        ledger.total_usd += cost;
        let entry = ledger.models.entry(rec.model.to_string()).or_default();
        entry.input_tokens += rec.input_tokens;
        entry.output_tokens += rec.output_tokens;
        entry.cost_usd += cost;
        entry.calls += 1;
        let text = serde_json::to_string_pretty(&ledger)
            .map_err(|e| TriadError::Serialization(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    fn state_path(&self) -> PathBuf {
        self.breakers_dir.join(COST_STATE_FILE)
    }

    fn read_state(&self) -> Option<CostState> {
        let text = std::fs::read_to_string(self.state_path()).ok()?;
        CostState::parse(&text)
    }

    fn write_state(&self, state: &CostState) {
        if let Err(e) = std::fs::write(self.state_path(), state.render()) {
            warn!(error = %e, "failed to persist cost breaker state");
        }
    }
}

/// key=value serialization for `breakers/cost.state`.
#[derive(Debug, Clone)]
struct CostState {
    state: String,
    day: String,
    reason: String,
    projected_usd: f64,
    threshold_usd: f64,
}

impl CostState {
    fn render(&self) -> String {
        format!(
            "state={}\nday={}\nreason={}\nprojected_usd={}\nthreshold_usd={}\n",
            self.state, self.day, self.reason, self.projected_usd, self.threshold_usd
        )
    }

    fn parse(text: &str) -> Option<Self> {
        let mut state = None;
        let mut day = None;
        let mut reason = None;
        let mut projected = 0.0;
        let mut threshold = 0.0;
        for line in text.lines() {
            let (k, v) = line.split_once('=')?;
            match k {
                "state" => state = Some(v.to_string()),
                "day" => day = Some(v.to_string()),
                "reason" => reason = Some(v.to_string()),
                "projected_usd" => projected = v.parse().ok()?,
                "threshold_usd" => threshold = v.parse().ok()?,
                _ => {}
            }
        }
        Some(Self {
            state: state?,
            day: day?,
            reason: reason?,
            projected_usd: projected,
            threshold_usd: threshold,
        })
    }
}

/// UTC day containing `ts` as [start, end).
fn day_window(ts: Timestamp) -> (Timestamp, Timestamp) {
    let dt: DateTime<Utc> = Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now);
    let start = Utc
        .with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
        .unwrap_or(ts);
    (start, start + 86_400)
}

fn day_string(ts: Timestamp) -> String {
    let dt: DateTime<Utc> = Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now);
    dt.format("%Y-%m-%d").to_string()
}
