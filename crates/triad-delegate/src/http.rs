//! HTTP transport for delegate endpoints.
//!
//! Each model maps to one endpoint URL. Requests POST a JSON body
//! `{prompt, timeout_s, trace_id}`; the response body must decode as a
//! strict envelope — anything else surfaces as a typed error for the
//! consensus engine to count as ABSTAIN.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use triad_core::envelope::{decode_envelope, DelegateEnvelope};
use triad_core::types::{ModelId, TraceId};
use triad_core::TriadError;

use crate::adapter::{DelegateAdapter, DelegateRequest};

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub timeout: Duration,
    /// Bounds in-flight calls per delegate (`models.*.max_concurrent`).
    pub permits: Arc<Semaphore>,
}

pub struct HttpDelegateAdapter {
    client: reqwest::Client,
    endpoints: HashMap<ModelId, Endpoint>,
}

impl HttpDelegateAdapter {
    /// Build from the `models.*` configuration table. Models without an
    /// endpoint are skipped (calls to them fail with a transport error).
    pub fn from_config(config: &triad_config::Config) -> Result<Self, TriadError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TriadError::Config(format!("building HTTP client: {e}")))?;
        let mut endpoints = HashMap::new();
        for (name, model_cfg) in &config.models {
            if !model_cfg.enabled {
                continue;
            }
            let Some(url) = &model_cfg.endpoint else {
                warn!(model = %name, "enabled delegate has no endpoint configured");
                continue;
            };
            endpoints.insert(
                ModelId::new(name.clone()),
                Endpoint {
                    url: url.clone(),
                    timeout: Duration::from_secs(model_cfg.timeout_seconds),
                    permits: Arc::new(Semaphore::new(model_cfg.max_concurrent.max(1) as usize)),
                },
            );
        }
        Ok(Self { client, endpoints })
    }
}

#[async_trait]
impl DelegateAdapter for HttpDelegateAdapter {
    async fn call(
        &self,
        model: &ModelId,
        request: &DelegateRequest,
    ) -> Result<DelegateEnvelope, TriadError> {
        let endpoint = self.endpoints.get(model).ok_or_else(|| TriadError::Transport {
            model: model.to_string(),
            detail: "no endpoint configured".into(),
        })?;

        let _permit = endpoint
            .permits
            .acquire()
            .await
            .map_err(|_| TriadError::Transport {
                model: model.to_string(),
                detail: "delegate permit pool closed".into(),
            })?;

        let timeout = endpoint.timeout.min(Duration::from_secs(request.timeout_s));
        let body = serde_json::json!({
            "prompt": request.prompt,
            "timeout_s": request.timeout_s,
            "trace_id": request.trace_id.as_str(),
        });

        debug!(model = %model, url = %endpoint.url, "delegate call");
        let started = std::time::Instant::now();

        let response = tokio::time::timeout(
            timeout,
            self.client
                .post(&endpoint.url)
                .header("x-trace-id", request.trace_id.as_str())
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| TriadError::DelegateTimeout {
            model: model.to_string(),
            timeout_s: timeout.as_secs(),
        })?
        .map_err(|e| classify_transport(model, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TriadError::Auth {
                model: model.to_string(),
            });
        }
        if !status.is_success() {
            return Err(TriadError::DelegateStatus {
                model: model.to_string(),
                status: status.as_u16().to_string(),
            });
        }

        let text = response.text().await.map_err(|e| classify_transport(model, e))?;
        let mut envelope = decode_envelope(&text)?;
        if envelope.model != model.as_str() {
            return Err(TriadError::Envelope(format!(
                "envelope model {} does not match called delegate {model}",
                envelope.model
            )));
        }
        if envelope.duration_ms.is_none() {
            envelope.duration_ms = Some(started.elapsed().as_millis() as u64);
        }
        if envelope.trace_id.is_none() {
            envelope.trace_id = Some(request.trace_id.as_str().to_string());
        }
        Ok(envelope)
    }
}

fn classify_transport(model: &ModelId, e: reqwest::Error) -> TriadError {
    if e.is_timeout() {
        TriadError::DelegateTimeout {
            model: model.to_string(),
            timeout_s: 0,
        }
    } else {
        TriadError::Transport {
            model: model.to_string(),
            detail: e.to_string(),
        }
    }
}

/// A trace id must survive child invocations: export it for spawned
/// processes exactly as it was received.
pub fn propagate_trace_env(trace: &TraceId) {
    std::env::set_var("TRACE_ID", trace.as_str());
}
