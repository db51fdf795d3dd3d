use async_trait::async_trait;

use triad_core::envelope::DelegateEnvelope;
use triad_core::types::{ModelId, TraceId};
use triad_core::TriadError;

/// One outbound delegate call: an already-sanitized prompt, the per-call
/// timeout, and the trace id to propagate.
#[derive(Debug, Clone)]
pub struct DelegateRequest {
    pub prompt: String,
    pub timeout_s: u64,
    pub trace_id: TraceId,
}

impl DelegateRequest {
    pub fn new(prompt: impl Into<String>, timeout_s: u64, trace_id: TraceId) -> Self {
        Self {
            prompt: prompt.into(),
            timeout_s,
            trace_id,
        }
    }
}

/// The delegate seam. Implementations must return a fully validated
/// envelope or a typed error; free text never crosses this boundary.
#[async_trait]
pub trait DelegateAdapter: Send + Sync {
    async fn call(
        &self,
        model: &ModelId,
        request: &DelegateRequest,
    ) -> Result<DelegateEnvelope, TriadError>;
}
