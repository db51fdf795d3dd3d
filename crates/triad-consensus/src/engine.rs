//! Review fan-out and collection.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use triad_core::review::{ConsensusRequest, Vote};
use triad_core::types::{RequestId, RequestStatus, TaskId, TraceId};
use triad_core::TriadError;
use triad_delegate::{DelegateAdapter, DelegateRequest};
use triad_store::Store;

use crate::aggregate::{aggregate, AggregationRules, Outcome};
use crate::roster::Roster;

/// What a caller reviews: a subject line and the sanitized context string.
#[derive(Debug, Clone)]
pub struct ReviewSpec {
    pub task_id: TaskId,
    pub review_type: String,
    pub subject: String,
    pub context: String,
}

pub struct ConsensusEngine {
    store: Arc<Store>,
    adapter: Arc<dyn DelegateAdapter>,
    roster: Roster,
    rules: AggregationRules,
    timeout: Duration,
}

impl ConsensusEngine {
    pub fn new(
        store: Arc<Store>,
        adapter: Arc<dyn DelegateAdapter>,
        roster: Roster,
        rules: AggregationRules,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            adapter,
            roster,
            rules,
            timeout,
        }
    }

    /// Run one review to completion: fan out, collect, persist, aggregate.
    ///
    /// Every delegate in the roster produces exactly one vote row; calls
    /// that fail validation, error out, or miss the deadline are recorded
    /// as ABSTAIN with the reason preserved.
    pub async fn review(&self, spec: &ReviewSpec, trace: &TraceId) -> Result<Outcome, TriadError> {
        let now = chrono::Utc::now().timestamp();
        let models = self.roster.for_review_type(&spec.review_type).to_vec();
        let request_id = RequestId::generate();

        self.store
            .record_routing_decision(&spec.task_id, &spec.review_type, &models, now)?;
        self.store.create_consensus_request(&ConsensusRequest {
            id: request_id.clone(),
            task_id: spec.task_id.clone(),
            review_type: spec.review_type.clone(),
            subject: spec.subject.clone(),
            context: spec.context.clone(),
            status: RequestStatus::InProgress,
            final_decision: None,
            approvals: 0,
            rejections: 0,
            abstentions: 0,
            created_at: now,
            updated_at: now,
            timeout_at: now + self.timeout.as_secs() as i64,
        })?;

        let prompt = build_prompt(spec);
        let request = DelegateRequest::new(prompt, self.timeout.as_secs(), trace.clone());

        // Parallel fan-out; each call individually bounded by the consensus
        // timeout so one hung delegate cannot stall the others' votes.
        let calls = models.iter().map(|model| {
            let adapter = Arc::clone(&self.adapter);
            let request = request.clone();
            let model = model.clone();
            let deadline = self.timeout;
            async move {
                let started = std::time::Instant::now();
                let result = tokio::time::timeout(deadline, adapter.call(&model, &request)).await;
                (model, started.elapsed(), result)
            }
        });
        let results = join_all(calls).await;

        let recorded_at = chrono::Utc::now().timestamp();
        for (model, elapsed, result) in results {
            let vote = match result {
                Ok(Ok(envelope)) => Vote {
                    request_id: request_id.clone(),
                    model: model.clone(),
                    decision: envelope.decision,
                    confidence: envelope.confidence,
                    reasoning: envelope.reasoning,
                    required_changes: envelope.required_changes,
                    latency_ms: Some(envelope.duration_ms.unwrap_or(elapsed.as_millis() as u64)),
                    recorded_at,
                },
                Ok(Err(e)) => {
                    warn!(model = %model, error = %e, "delegate response counted as abstain");
                    Vote::abstain(request_id.clone(), model.clone(), e.to_string(), recorded_at)
                }
                Err(_) => {
                    warn!(model = %model, "delegate missed consensus deadline");
                    Vote::abstain(request_id.clone(), model.clone(), "timeout", recorded_at)
                }
            };
            self.store.record_vote(&vote, trace)?;
        }

        // Aggregate from what the store actually holds, so replays and
        // concurrent writers cannot double-count.
        let votes = self.store.votes_for_request(&request_id)?;
        let mut outcome = aggregate(&votes, &self.rules);
        outcome.request_id = Some(request_id.as_str().to_string());

        self.store.finalize_consensus_request(
            &request_id,
            outcome.status,
            Some(outcome.final_decision),
            outcome.approvals,
            outcome.rejections,
            outcome.abstentions,
            trace,
            chrono::Utc::now().timestamp(),
        )?;

        info!(
            request = %request_id,
            review_type = %spec.review_type,
            decision = %outcome.final_decision,
            approvals = outcome.approvals,
            rejections = outcome.rejections,
            abstentions = outcome.abstentions,
            "consensus finalized"
        );
        Ok(outcome)
    }
}

fn build_prompt(spec: &ReviewSpec) -> String {
    format!(
        "Review type: {}\nSubject: {}\n\n{}\n\nRespond with a JSON envelope: \
         {{model, status, decision, confidence, reasoning, required_changes?}}.",
        spec.review_type, spec.subject, spec.context
    )
}
