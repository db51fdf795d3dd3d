use serde::{Deserialize, Serialize};

use crate::types::{ModelId, Timestamp, TraceId};

/// One outbound delegate call's metered usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub model: ModelId,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub task_type: String,
    pub ts: Timestamp,
    pub trace_id: TraceId,
}

/// USD cost of a call under per-1k-token rates.
pub fn call_cost_usd(
    input_tokens: u64,
    output_tokens: u64,
    rate_in_per_1k: f64,
    rate_out_per_1k: f64,
) -> f64 {
    (input_tokens as f64 / 1000.0) * rate_in_per_1k
        + (output_tokens as f64 / 1000.0) * rate_out_per_1k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_formula() {
        // 2000 in @ $0.50/1k + 1000 out @ $1.50/1k = $2.50
        let c = call_cost_usd(2_000, 1_000, 0.5, 1.5);
        assert!((c - 2.5).abs() < 1e-9);
    }
}
