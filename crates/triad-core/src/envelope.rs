//! The delegate response envelope and its strict decoder.
//!
//! Delegates are opaque endpoints; the only thing the kernel trusts is a
//! well-formed JSON envelope. Anything else — invalid JSON, missing fields,
//! out-of-range confidence, unknown decision strings — is rejected and the
//! vote is counted as ABSTAIN by the caller. There is deliberately no
//! free-text fallback.

use serde::{Deserialize, Serialize};

use crate::error::TriadError;
use crate::score;
use crate::types::Decision;

/// A validated delegate response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateEnvelope {
    pub model: String,
    pub status: String,
    pub decision: Decision,
    /// Always in [0, 1] after decoding.
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_changes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Wire shape before validation. Decision and confidence are kept loose here
/// so a malformed value produces a typed rejection instead of a serde panic
/// path the caller cannot distinguish from transport trouble.
#[derive(Deserialize)]
struct RawEnvelope {
    model: String,
    status: String,
    decision: serde_json::Value,
    confidence: serde_json::Value,
    reasoning: String,
    #[serde(default)]
    required_changes: Option<Vec<String>>,
    #[serde(default)]
    trace_id: Option<String>,
    #[serde(default)]
    duration_ms: Option<u64>,
}

/// Decode and validate one delegate envelope from raw response text.
pub fn decode_envelope(raw: &str) -> Result<DelegateEnvelope, TriadError> {
    let parsed: RawEnvelope = serde_json::from_str(raw)
        .map_err(|e| TriadError::Envelope(format!("invalid envelope JSON: {e}")))?;

    let decision = match &parsed.decision {
        serde_json::Value::String(s) => Decision::parse(s)?,
        other => {
            return Err(TriadError::Envelope(format!(
                "decision must be a string, got {other}"
            )))
        }
    };

    // Confidence may arrive as a JSON number or a quoted numeric string;
    // both pass through the central score validator.
    let confidence = match &parsed.confidence {
        serde_json::Value::Number(n) => {
            let v = n
                .as_f64()
                .ok_or_else(|| TriadError::Envelope("confidence not representable".into()))?;
            score::validate_confidence(v)?
        }
        serde_json::Value::String(s) => score::validate_score(s, score::ScoreScale::Unit)?,
        other => {
            return Err(TriadError::Envelope(format!(
                "confidence must be numeric, got {other}"
            )))
        }
    };

    if parsed.model.trim().is_empty() {
        return Err(TriadError::Envelope("model must not be empty".into()));
    }

    Ok(DelegateEnvelope {
        model: parsed.model,
        status: parsed.status,
        decision,
        confidence,
        reasoning: parsed.reasoning,
        required_changes: parsed.required_changes,
        trace_id: parsed.trace_id,
        duration_ms: parsed.duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_json(decision: &str, confidence: &str) -> String {
        format!(
            r#"{{"model":"claude","status":"ok","decision":{decision},"confidence":{confidence},"reasoning":"looks fine"}}"#
        )
    }

    #[test]
    fn decodes_a_valid_envelope() {
        let env = decode_envelope(&envelope_json("\"APPROVE\"", "0.85")).unwrap();
        assert_eq!(env.decision, Decision::Approve);
        assert_eq!(env.confidence, 0.85);
        assert_eq!(env.model, "claude");
    }

    #[test]
    fn rejects_unknown_decision() {
        let err = decode_envelope(&envelope_json("\"SHIP_IT\"", "0.9")).unwrap_err();
        assert!(matches!(err, TriadError::Envelope(_)));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        assert!(decode_envelope(&envelope_json("\"APPROVE\"", "1.5")).is_err());
        assert!(decode_envelope(&envelope_json("\"APPROVE\"", "-0.1")).is_err());
    }

    #[test]
    fn rejects_missing_fields() {
        let err = decode_envelope(r#"{"model":"codex","decision":"APPROVE"}"#).unwrap_err();
        assert!(matches!(err, TriadError::Envelope(_)));
    }

    #[test]
    fn rejects_free_text() {
        let err = decode_envelope("I approve this change, confidence high").unwrap_err();
        assert!(matches!(err, TriadError::Envelope(_)));
    }

    #[test]
    fn confidence_as_string_passes_score_validation() {
        let env = decode_envelope(&envelope_json("\"REJECT\"", "\"0.95\"")).unwrap();
        assert_eq!(env.confidence, 0.95);

        let err = decode_envelope(&envelope_json("\"REJECT\"", "\"0.9;id\"")).unwrap_err();
        assert!(matches!(err, TriadError::ScoreInvalid { .. }));
    }

    #[test]
    fn optional_fields_default() {
        let env = decode_envelope(&envelope_json("\"ABSTAIN\"", "0.5")).unwrap();
        assert!(env.required_changes.is_none());
        assert!(env.trace_id.is_none());
        assert!(env.duration_ms.is_none());
    }
}
