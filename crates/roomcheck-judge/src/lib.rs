//! Judgment engine: asks a reasoning backend whether one detection breaks any of
//! the rules retrieved for it, and only trusts answers that pass strict validation.
//!
//! Every call produces a verdict. Backend errors, timeouts and malformed answers
//! are retried up to the attempt budget and then replaced by a conservative
//! no-violation verdict that records why. Cancellation interrupts an in-flight
//! backend call instead of waiting for it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use roomcheck_core::config::JudgeConfig;
use roomcheck_core::types::{Detection, ImageContext, RetrievedRule, Severity, Verdict};
use roomcheck_core::CancellationToken;

mod http;
mod reply;
mod request;

pub use http::{generated_text, HttpReasoningBackend};
pub use reply::{extract_json_object, validate, BackendReply};
pub use request::{render_prompt, CandidateRule, ReasoningRequest};

/// Generative backend that answers a [`ReasoningRequest`] with raw text.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    fn backend_id(&self) -> &str;
    async fn complete(&self, request: &ReasoningRequest) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Retry,
    Fallback,
}

/// Next step after `attempt` (1-based) produced `reply`.
pub fn decide(attempt: u32, max_attempts: u32, reply: &BackendReply) -> Decision {
    match reply {
        BackendReply::Parsed(_) => Decision::Accept,
        BackendReply::Malformed(_) if attempt < max_attempts => Decision::Retry,
        BackendReply::Malformed(_) => Decision::Fallback,
    }
}

pub const NO_RULES_RATIONALE: &str = "no policy rules retrieved";
pub const CANCELLED_RATIONALE: &str = "assessment cancelled";

#[derive(Clone)]
pub struct JudgmentEngine {
    backend: Arc<dyn ReasoningBackend>,
    timeout: Duration,
    max_attempts: u32,
}

impl JudgmentEngine {
    pub fn new(backend: Arc<dyn ReasoningBackend>, timeout: Duration, max_attempts: u32) -> Self {
        Self { backend, timeout, max_attempts: max_attempts.max(1) }
    }

    pub fn from_config(backend: Arc<dyn ReasoningBackend>, config: &JudgeConfig) -> Self {
        Self::new(backend, Duration::from_secs(config.timeout_secs), config.max_attempts)
    }

    pub async fn assess(&self, detection: &Detection, candidate_rules: &[RetrievedRule]) -> Verdict {
        self.assess_with_cancel(detection, candidate_rules, &CancellationToken::new()).await
    }

    pub async fn assess_with_cancel(
        &self,
        detection: &Detection,
        candidate_rules: &[RetrievedRule],
        cancel: &CancellationToken,
    ) -> Verdict {
        self.assess_in_context(detection, candidate_rules, None, cancel).await
    }

    /// Judge `detection` with the photo's scene context included in the question.
    pub async fn assess_in_context(
        &self,
        detection: &Detection,
        candidate_rules: &[RetrievedRule],
        context: Option<&ImageContext>,
        cancel: &CancellationToken,
    ) -> Verdict {
        if candidate_rules.is_empty() {
            debug!(label = %detection.label, "no candidate rules, skipping backend");
            return Verdict {
                recommended_action: Severity::None.default_action().to_string(),
                ..Verdict::conservative(detection.clone(), NO_RULES_RATIONALE)
            };
        }
        let request = ReasoningRequest::new(detection, candidate_rules).with_room_type(context.map(|c| c.room_type));
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Verdict::conservative(detection.clone(), CANCELLED_RATIONALE);
            }
            let reply = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(label = %detection.label, attempt, "assessment cancelled during backend call");
                    return Verdict::conservative(detection.clone(), CANCELLED_RATIONALE);
                }
                reply = self.attempt(detection, &request) => reply,
            };
            match (decide(attempt, self.max_attempts, &reply), reply) {
                (Decision::Accept, BackendReply::Parsed(verdict)) => {
                    info!(
                        label = %detection.label,
                        violation = verdict.violation_found,
                        severity = %verdict.severity,
                        attempt,
                        "verdict accepted"
                    );
                    return verdict;
                }
                (Decision::Retry, BackendReply::Malformed(reason)) => {
                    debug!(label = %detection.label, attempt, %reason, "retrying reasoning backend");
                }
                (_, reply) => {
                    let reason = reply.reason().unwrap_or("unexpected reply").to_string();
                    warn!(label = %detection.label, attempts = attempt, %reason, "falling back to conservative verdict");
                    return Verdict::conservative(
                        detection.clone(),
                        format!("fallback after {attempt} attempt(s): {reason}"),
                    );
                }
            }
        }
    }

    async fn attempt(&self, detection: &Detection, request: &ReasoningRequest) -> BackendReply {
        match tokio::time::timeout(self.timeout, self.backend.complete(request)).await {
            Err(_) => BackendReply::Malformed(format!("{} timed out after {:?}", self.backend.backend_id(), self.timeout)),
            Ok(Err(e)) => BackendReply::Malformed(format!("{} failed: {e:#}", self.backend.backend_id())),
            Ok(Ok(raw)) => validate(&raw, detection, request),
        }
    }
}
