//! Vote aggregation. Pure: a list of recorded votes in, an outcome out.

use tracing::debug;

use triad_core::review::Vote;
use triad_core::types::{Decision, RequestStatus};

#[derive(Debug, Clone)]
pub struct AggregationRules {
    /// Approvals required for a final APPROVE.
    pub approval_threshold: u32,
    /// APPROVE below this confidence is downgraded to ABSTAIN.
    pub min_confidence: f64,
    /// Recorded on rejects; any REJECT blocks regardless of this value.
    pub reject_confidence: f64,
}

impl Default for AggregationRules {
    fn default() -> Self {
        Self {
            approval_threshold: triad_core::constants::CONSENSUS_APPROVAL_THRESHOLD,
            min_confidence: triad_core::constants::CONSENSUS_MIN_CONFIDENCE,
            reject_confidence: triad_core::constants::CONSENSUS_REJECT_CONFIDENCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Set by the engine after the request row exists; pure aggregation
    /// leaves it empty.
    pub request_id: Option<String>,
    pub final_decision: Decision,
    pub status: RequestStatus,
    pub approvals: u32,
    pub rejections: u32,
    pub abstentions: u32,
    pub changes_requested: u32,
    /// Aggregated required_changes from every REQUEST_CHANGES vote.
    pub required_changes: Vec<String>,
    /// Reasoning lines from blocking votes, for the caller's report.
    pub blocking_reasons: Vec<String>,
}

impl Outcome {
    pub fn approved(&self) -> bool {
        self.final_decision == Decision::Approve
    }
}

/// Apply the aggregation rules:
///
/// 1. ABSTAIN never counts toward approvals or rejections.
/// 2. APPROVE below `min_confidence` is downgraded to ABSTAIN.
/// 3. Any REJECT wins.
/// 4. Else any REQUEST_CHANGES wins.
/// 5. Else approvals >= threshold → APPROVE.
/// 6. Else ABSTAIN, status PENDING.
pub fn aggregate(votes: &[Vote], rules: &AggregationRules) -> Outcome {
    let mut approvals = 0u32;
    let mut rejections = 0u32;
    let mut abstentions = 0u32;
    let mut changes_requested = 0u32;
    let mut required_changes = Vec::new();
    let mut blocking_reasons = Vec::new();

    for vote in votes {
        let effective = match vote.decision {
            Decision::Approve if vote.confidence < rules.min_confidence => {
                debug!(
                    model = %vote.model,
                    confidence = vote.confidence,
                    min = rules.min_confidence,
                    "approval below confidence floor counted as abstain"
                );
                Decision::Abstain
            }
            d => d,
        };
        match effective {
            Decision::Approve => approvals += 1,
            Decision::Reject => {
                rejections += 1;
                blocking_reasons.push(format!("{}: {}", vote.model, vote.reasoning));
            }
            Decision::Abstain => abstentions += 1,
            Decision::RequestChanges => {
                changes_requested += 1;
                if let Some(changes) = &vote.required_changes {
                    required_changes.extend(changes.iter().cloned());
                }
                blocking_reasons.push(format!("{}: {}", vote.model, vote.reasoning));
            }
        }
    }

    let (final_decision, status) = if rejections > 0 {
        (Decision::Reject, RequestStatus::Rejected)
    } else if changes_requested > 0 {
        (Decision::RequestChanges, RequestStatus::ChangesRequested)
    } else if approvals >= rules.approval_threshold {
        (Decision::Approve, RequestStatus::Approved)
    } else {
        (Decision::Abstain, RequestStatus::Pending)
    };

    Outcome {
        request_id: None,
        final_decision,
        status,
        approvals,
        rejections,
        abstentions,
        changes_requested,
        required_changes,
        blocking_reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triad_core::types::{ModelId, RequestId};

    fn vote(model: &str, decision: Decision, confidence: f64) -> Vote {
        Vote {
            request_id: RequestId("review-1".into()),
            model: ModelId::new(model),
            decision,
            confidence,
            reasoning: "r".into(),
            required_changes: None,
            latency_ms: None,
            recorded_at: 100,
        }
    }

    fn rules() -> AggregationRules {
        AggregationRules::default()
    }

    #[test]
    fn two_confident_approvals_approve() {
        let out = aggregate(
            &[
                vote("codex", Decision::Approve, 0.85),
                vote("claude", Decision::Approve, 0.8),
            ],
            &rules(),
        );
        assert_eq!(out.final_decision, Decision::Approve);
        assert_eq!(out.status, RequestStatus::Approved);
        assert_eq!(out.approvals, 2);
    }

    #[test]
    fn single_reject_wins_over_confident_approvals() {
        let out = aggregate(
            &[
                vote("codex", Decision::Approve, 0.9),
                vote("claude", Decision::Reject, 0.9),
                vote("gemini", Decision::Approve, 0.9),
            ],
            &rules(),
        );
        assert_eq!(out.final_decision, Decision::Reject);
        assert_eq!(out.status, RequestStatus::Rejected);
        assert_eq!((out.approvals, out.rejections), (2, 1));
    }

    #[test]
    fn low_confidence_approval_is_abstain() {
        let out = aggregate(
            &[
                vote("codex", Decision::Approve, 0.69),
                vote("claude", Decision::Approve, 0.9),
            ],
            &rules(),
        );
        // One effective approval is below the threshold of two.
        assert_eq!(out.approvals, 1);
        assert_eq!(out.abstentions, 1);
        assert_eq!(out.final_decision, Decision::Abstain);
        assert_eq!(out.status, RequestStatus::Pending);
    }

    #[test]
    fn low_confidence_reject_still_blocks() {
        // reject_confidence is recorded but does not gate blocking.
        let out = aggregate(
            &[
                vote("codex", Decision::Approve, 0.95),
                vote("claude", Decision::Reject, 0.2),
                vote("gemini", Decision::Approve, 0.95),
            ],
            &rules(),
        );
        assert_eq!(out.final_decision, Decision::Reject);
    }

    #[test]
    fn request_changes_wins_absent_rejects() {
        let out = aggregate(
            &[
                vote("codex", Decision::Approve, 0.9),
                vote("claude", Decision::RequestChanges, 0.8),
                vote("gemini", Decision::Approve, 0.9),
            ],
            &rules(),
        );
        assert_eq!(out.final_decision, Decision::RequestChanges);
        assert_eq!(out.status, RequestStatus::ChangesRequested);
    }

    #[test]
    fn abstains_never_count_either_way() {
        let out = aggregate(
            &[
                vote("codex", Decision::Abstain, 0.0),
                vote("claude", Decision::Abstain, 0.0),
                vote("gemini", Decision::Approve, 0.9),
            ],
            &rules(),
        );
        assert_eq!(out.approvals, 1);
        assert_eq!(out.abstentions, 2);
        assert_eq!(out.final_decision, Decision::Abstain);
        assert_eq!(out.status, RequestStatus::Pending);
    }

    #[test]
    fn required_changes_are_collected() {
        let mut v = vote("claude", Decision::RequestChanges, 0.8);
        v.required_changes = Some(vec!["add tests".into(), "handle overflow".into()]);
        let out = aggregate(&[v], &rules());
        assert_eq!(out.required_changes, vec!["add tests", "handle overflow"]);
    }
}
