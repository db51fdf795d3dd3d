//! Gating wrapper applied to every outbound delegate call.
//!
//! Order matters: rate limiter, then cost gate, then circuit breaker.
//! Quota rejections (rate, budget) must not consume a breaker probe or
//! count as delegate failures — they are our refusal, not the delegate's.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use triad_breakers::{Admission, BreakerSet, CostTracker, RateLimiter, RateStrategy};
use triad_core::cost::CostRecord;
use triad_core::envelope::DelegateEnvelope;
use triad_core::error::ErrorClass;
use triad_core::types::{ModelId, Timestamp};
use triad_core::TriadError;

use crate::adapter::{DelegateAdapter, DelegateRequest};

/// Rough prompt-size heuristic used for cost projection.
const CHARS_PER_TOKEN: u64 = 4;

/// Output allowance assumed per call when projecting cost.
const OUTPUT_TOKENS_ESTIMATE: u64 = 1_024;

pub struct GatedAdapter {
    inner: Arc<dyn DelegateAdapter>,
    breakers: Arc<BreakerSet>,
    cost: Arc<CostTracker>,
    rate: Option<(Arc<RateLimiter>, RateStrategy)>,
    /// Task type attached to cost rows; set per call site.
    task_type: String,
}

impl GatedAdapter {
    pub fn new(
        inner: Arc<dyn DelegateAdapter>,
        breakers: Arc<BreakerSet>,
        cost: Arc<CostTracker>,
        rate: Option<(Arc<RateLimiter>, RateStrategy)>,
    ) -> Self {
        Self {
            inner,
            breakers,
            cost,
            rate,
            task_type: "DEFAULT".into(),
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    fn estimate_input_tokens(prompt: &str) -> u64 {
        (prompt.len() as u64 / CHARS_PER_TOKEN).max(1)
    }

    /// The gated call with an explicit clock, for tests.
    pub async fn call_at(
        &self,
        model: &ModelId,
        request: &DelegateRequest,
        now: Timestamp,
    ) -> Result<DelegateEnvelope, TriadError> {
        self.cost.reset_if_new_day(now);

        if let Some((limiter, strategy)) = &self.rate {
            limiter.check(model.as_str(), strategy, &request.trace_id, now)?;
        }

        let est_in = Self::estimate_input_tokens(&request.prompt);
        self.cost
            .check(model, est_in, OUTPUT_TOKENS_ESTIMATE, &request.trace_id, now)?;

        let admission = self.breakers.try_acquire(model, now)?;
        debug!(model = %model, ?admission, "delegate call admitted");

        let started = std::time::Instant::now();
        match self.inner.call(model, request).await {
            Ok(envelope) => {
                let finished = now + started.elapsed().as_secs() as i64;
                self.breakers.record_success(model, finished);
                let record = CostRecord {
                    model: model.clone(),
                    input_tokens: est_in,
                    output_tokens: OUTPUT_TOKENS_ESTIMATE,
                    duration_ms: envelope
                        .duration_ms
                        .unwrap_or(started.elapsed().as_millis() as u64),
                    task_type: self.task_type.clone(),
                    ts: finished,
                    trace_id: request.trace_id.clone(),
                };
                self.cost.record(&record)?;
                Ok(envelope)
            }
            Err(e) => {
                let finished = now + started.elapsed().as_secs() as i64;
                match e.class() {
                    // Transport trouble is what the breaker exists for;
                    // auth failures are catastrophic and trip immediately.
                    ErrorClass::Transient => self.breakers.record_failure(model, false, finished),
                    ErrorClass::NonRetryable if matches!(e, TriadError::Auth { .. }) => {
                        self.breakers.record_failure(model, true, finished)
                    }
                    // Schema violations say nothing about transport health.
                    _ => self.breakers.release_probe(model),
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl DelegateAdapter for GatedAdapter {
    async fn call(
        &self,
        model: &ModelId,
        request: &DelegateRequest,
    ) -> Result<DelegateEnvelope, TriadError> {
        self.call_at(model, request, chrono::Utc::now().timestamp()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedAdapter;
    use triad_config::CostLimits;
    use triad_core::types::{Decision, TraceId};
    use triad_locks::LockManager;
    use triad_store::Store;

    fn gated(
        dir: &std::path::Path,
        scripted: Arc<ScriptedAdapter>,
        limits: CostLimits,
    ) -> (Arc<Store>, Arc<BreakerSet>, GatedAdapter) {
        let store = Arc::new(Store::open(dir).unwrap());
        let breakers = Arc::new(BreakerSet::new(dir, Arc::clone(&store), 5, 120).unwrap());
        let cost = Arc::new(
            CostTracker::new(dir, Arc::clone(&store), LockManager::default(), limits).unwrap(),
        );
        let gate = GatedAdapter::new(scripted, Arc::clone(&breakers), cost, None);
        (store, breakers, gate)
    }

    fn no_limits() -> CostLimits {
        CostLimits::default()
    }

    #[tokio::test]
    async fn breaker_open_short_circuits_without_reaching_delegate() {
        let dir = tempfile::tempdir().unwrap();
        let mut scripted = ScriptedAdapter::new();
        for _ in 0..5 {
            scripted = scripted.fail_transport("codex");
        }
        let scripted = Arc::new(scripted);
        let (_store, breakers, gate) = gated(dir.path(), Arc::clone(&scripted), no_limits());

        let model = ModelId::new("codex");
        let req = DelegateRequest::new("do the thing", 30, TraceId::generate());

        for i in 0..5 {
            assert!(gate.call_at(&model, &req, 100 + i).await.is_err());
        }
        assert_eq!(scripted.call_count(), 5);
        assert_eq!(
            breakers.state_of(&model),
            triad_core::types::BreakerState::Open
        );

        // Sixth call: rejected by the breaker, no delegate traffic.
        let err = gate.call_at(&model, &req, 110).await.unwrap_err();
        assert!(matches!(err, TriadError::BreakerOpen { .. }));
        assert_eq!(scripted.call_count(), 5);
    }

    #[tokio::test]
    async fn probe_success_closes_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let mut scripted = ScriptedAdapter::new();
        for _ in 0..5 {
            scripted = scripted.fail_transport("codex");
        }
        let scripted = Arc::new(scripted.respond("codex", Decision::Approve, 0.9));
        let (_store, breakers, gate) = gated(dir.path(), Arc::clone(&scripted), no_limits());

        let model = ModelId::new("codex");
        let req = DelegateRequest::new("probe", 30, TraceId::generate());
        for i in 0..5 {
            let _ = gate.call_at(&model, &req, 100 + i).await;
        }

        // After the cooldown the probe goes through and closes the breaker.
        let envelope = gate.call_at(&model, &req, 104 + 121).await.unwrap();
        assert_eq!(envelope.decision, Decision::Approve);
        assert_eq!(
            breakers.state_of(&model),
            triad_core::types::BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn auth_failure_trips_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = Arc::new(ScriptedAdapter::new().fail_auth("claude"));
        let (_store, breakers, gate) = gated(dir.path(), Arc::clone(&scripted), no_limits());

        let model = ModelId::new("claude");
        let req = DelegateRequest::new("x", 30, TraceId::generate());
        assert!(matches!(
            gate.call_at(&model, &req, 100).await,
            Err(TriadError::Auth { .. })
        ));
        assert_eq!(
            breakers.state_of(&model),
            triad_core::types::BreakerState::Open
        );
    }

    #[tokio::test]
    async fn cost_refusal_does_not_count_against_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let mut per_1k = std::collections::BTreeMap::new();
        per_1k.insert(
            "codex".into(),
            triad_config::TokenRates { input: 100.0, output: 100.0 },
        );
        let limits = CostLimits {
            enabled: true,
            daily_budget_usd: 0.5,
            margin_pct: 0.15,
            reserve_usd: 1.0,
            per_1k_tokens: per_1k,
        };
        let scripted = Arc::new(ScriptedAdapter::new().respond("codex", Decision::Approve, 0.9));
        let (_store, breakers, gate) = gated(dir.path(), Arc::clone(&scripted), limits);

        let model = ModelId::new("codex");
        let req = DelegateRequest::new("expensive prompt", 30, TraceId::generate());
        let err = gate.call_at(&model, &req, 100).await.unwrap_err();
        assert!(matches!(err, TriadError::BudgetExhausted { .. }));
        assert_eq!(scripted.call_count(), 0);
        assert_eq!(
            breakers.state_of(&model),
            triad_core::types::BreakerState::Closed
        );
    }
}
