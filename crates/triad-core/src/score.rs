//! Centralized numeric-score validation.
//!
//! Every boundary where an external party supplies a score (delegate
//! confidences, review scores) funnels through this module. Free text is
//! never interpreted as a number.

use tracing::warn;

use crate::error::TriadError;

/// Characters that must never appear in a score string. Their presence is
/// treated as an injection attempt, not a formatting mistake.
const SHELL_METACHARACTERS: &[char] = &['$', '`', ';', '|', '&', '<', '>'];

/// Accepted numeric range for a score field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreScale {
    /// Confidence-style scores in [0, 1].
    Unit,
    /// Percentage-style scores in [0, 100].
    Percent,
}

impl ScoreScale {
    fn max(self) -> f64 {
        match self {
            Self::Unit => 1.0,
            Self::Percent => 100.0,
        }
    }
}

/// Validate an externally supplied score string against `scale`.
///
/// Rejects empty strings, shell metacharacters, non-numeric text, NaN and
/// infinities, and out-of-range values. A score exactly at the top of the
/// Percent scale is accepted with a warning (it is usually a delegate
/// confusing scales).
pub fn validate_score(raw: &str, scale: ScoreScale) -> Result<f64, TriadError> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Err(TriadError::ScoreInvalid {
            raw: raw.to_string(),
            reason: "empty".into(),
        });
    }

    if let Some(bad) = trimmed.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(TriadError::ScoreInvalid {
            raw: raw.to_string(),
            reason: format!("contains metacharacter {bad:?}"),
        });
    }

    // Only digits, one leading sign, and one decimal point are numeric input.
    // `parse::<f64>` alone would accept "inf", "NaN", and exponents.
    let body = trimmed.strip_prefix('-').unwrap_or(trimmed);
    let numeric_shape =
        !body.is_empty() && body.chars().all(|c| c.is_ascii_digit() || c == '.');
    if !numeric_shape {
        return Err(TriadError::ScoreInvalid {
            raw: raw.to_string(),
            reason: "not a number".into(),
        });
    }

    let value: f64 = trimmed.parse().map_err(|_| TriadError::ScoreInvalid {
        raw: raw.to_string(),
        reason: "not a number".into(),
    })?;

    validate_score_value(value, scale).map_err(|_| TriadError::ScoreInvalid {
        raw: raw.to_string(),
        reason: format!("out of range for {scale:?}"),
    })?;

    if scale == ScoreScale::Percent && value == scale.max() {
        warn!(score = value, "score at scale maximum; verify delegate scale");
    }

    Ok(value)
}

/// Validate an already-numeric score against `scale`.
pub fn validate_score_value(value: f64, scale: ScoreScale) -> Result<f64, TriadError> {
    if !value.is_finite() || value < 0.0 || value > scale.max() {
        return Err(TriadError::ScoreInvalid {
            raw: value.to_string(),
            reason: format!("out of range for {scale:?}"),
        });
    }
    Ok(value)
}

/// Validate a delegate confidence. Confidences live in [0, 1].
pub fn validate_confidence(value: f64) -> Result<f64, TriadError> {
    validate_score_value(value, ScoreScale::Unit)
}
