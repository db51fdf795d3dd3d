//! A deterministic delegate for tests and rehearsals: each model replays a
//! queue of canned outcomes. Also counts calls, so tests can assert that an
//! open breaker really did short-circuit before any "network" activity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use triad_core::envelope::DelegateEnvelope;
use triad_core::types::{Decision, ModelId, TraceId};
use triad_core::TriadError;

use crate::adapter::{DelegateAdapter, DelegateRequest};

enum Scripted {
    Envelope(DelegateEnvelope),
    Error(fn(&ModelId) -> TriadError),
    /// Sleep long enough that any sane consensus timeout fires first.
    Hang(Duration),
}

#[derive(Default)]
pub struct ScriptedAdapter {
    scripts: Mutex<HashMap<ModelId, Vec<Scripted>>>,
    calls: AtomicU64,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a decision/confidence envelope for `model`.
    pub fn respond(self, model: &str, decision: Decision, confidence: f64) -> Self {
        self.push(
            model,
            Scripted::Envelope(envelope(model, decision, confidence)),
        )
    }

    /// Queue a transport failure for `model`.
    pub fn fail_transport(self, model: &str) -> Self {
        self.push(
            model,
            Scripted::Error(|m| TriadError::Transport {
                model: m.to_string(),
                detail: "connection reset by peer".into(),
            }),
        )
    }

    /// Queue an auth failure (catastrophic for the breaker).
    pub fn fail_auth(self, model: &str) -> Self {
        self.push(
            model,
            Scripted::Error(|m| TriadError::Auth {
                model: m.to_string(),
            }),
        )
    }

    /// Queue a response that never arrives within any reasonable timeout.
    pub fn hang(self, model: &str) -> Self {
        self.push(model, Scripted::Hang(Duration::from_secs(3_600)))
    }

    /// Total calls that reached this adapter.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(self, model: &str, item: Scripted) -> Self {
        self.scripts
            .lock()
            .expect("script table poisoned")
            .entry(ModelId::new(model))
            .or_default()
            .push(item);
        self
    }
}

fn envelope(model: &str, decision: Decision, confidence: f64) -> DelegateEnvelope {
    DelegateEnvelope {
        model: model.to_string(),
        status: "ok".into(),
        decision,
        confidence,
        reasoning: format!("scripted {decision}"),
        required_changes: None,
        trace_id: None,
        duration_ms: Some(10),
    }
}

#[async_trait]
impl DelegateAdapter for ScriptedAdapter {
    async fn call(
        &self,
        model: &ModelId,
        request: &DelegateRequest,
    ) -> Result<DelegateEnvelope, TriadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut scripts = self.scripts.lock().expect("script table poisoned");
            let queue = scripts.get_mut(model);
            match queue {
                Some(q) if !q.is_empty() => q.remove(0),
                _ => {
                    return Err(TriadError::Transport {
                        model: model.to_string(),
                        detail: "no scripted response".into(),
                    })
                }
            }
        };
        match next {
            Scripted::Envelope(mut env) => {
                env.trace_id = Some(request.trace_id.as_str().to_string());
                Ok(env)
            }
            Scripted::Error(make) => Err(make(model)),
            Scripted::Hang(d) => {
                tokio::time::sleep(d).await;
                Err(TriadError::DelegateTimeout {
                    model: model.to_string(),
                    timeout_s: d.as_secs(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_errors() {
        let adapter = ScriptedAdapter::new()
            .respond("claude", Decision::Approve, 0.9)
            .respond("claude", Decision::Reject, 0.95);
        let req = DelegateRequest::new("review this", 30, TraceId::generate());
        let model = ModelId::new("claude");

        let first = adapter.call(&model, &req).await.unwrap();
        assert_eq!(first.decision, Decision::Approve);
        let second = adapter.call(&model, &req).await.unwrap();
        assert_eq!(second.decision, Decision::Reject);
        assert!(adapter.call(&model, &req).await.is_err());
        assert_eq!(adapter.call_count(), 3);
    }
}
