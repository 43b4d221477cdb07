use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;

use roomcheck_core::types::{
    Detection, ImageContext, ObjectCategory, RetrievedRule, RuleFragment, RuleType, Severity, SourceOffset,
};
use roomcheck_core::CancellationToken;
use roomcheck_judge::{
    decide, validate, BackendReply, Decision, JudgmentEngine, ReasoningBackend, ReasoningRequest, CANCELLED_RATIONALE,
    NO_RULES_RATIONALE,
};

/// Plays back canned answers in order; the last one repeats.
struct ScriptedBackend {
    replies: Mutex<VecDeque<anyhow::Result<String>>>,
    calls: AtomicUsize,
    last_request: Mutex<Option<ReasoningRequest>>,
}

impl ScriptedBackend {
    fn new(replies: Vec<anyhow::Result<String>>) -> Arc<Self> {
        Arc::new(Self { replies: Mutex::new(replies.into()), calls: AtomicUsize::new(0), last_request: Mutex::new(None) })
    }

    fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    fn backend_id(&self) -> &str { "scripted" }

    async fn complete(&self, request: &ReasoningRequest) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        let mut replies = self.replies.lock().unwrap();
        if replies.len() > 1 {
            return replies.pop_front().unwrap();
        }
        match replies.front() {
            Some(Ok(text)) => Ok(text.clone()),
            Some(Err(e)) => Err(anyhow::anyhow!("{e}")),
            None => Err(anyhow::anyhow!("script exhausted")),
        }
    }
}

struct SlowBackend;

#[async_trait]
impl ReasoningBackend for SlowBackend {
    fn backend_id(&self) -> &str { "slow" }

    async fn complete(&self, _request: &ReasoningRequest) -> anyhow::Result<String> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(String::new())
    }
}

fn alcohol() -> Detection { Detection::new("alcohol bottle", ObjectCategory::Substance, 0.82) }

fn rule(id: &str, text: &str) -> RetrievedRule {
    RetrievedRule {
        fragment: RuleFragment {
            id: id.into(),
            text: text.into(),
            embedding: vec![0.0; 4],
            rule_type: RuleType::classify(text),
            source_offset: SourceOffset { ordinal: 0, start: 0, end: text.len() },
        },
        relevance_score: 0.7,
    }
}

fn rules() -> Vec<RetrievedRule> {
    vec![
        rule("a1b2", "Alcohol containers are not allowed in rooms of underage students."),
        rule("c3d4", "Candles are prohibited."),
    ]
}

const GOOD: &str = r#"{"violation_found": true, "matched_rule_ids": ["a1b2"], "severity": "medium", "confidence": 0.85, "rationale": "An alcohol container is visible."}"#;
const UNKNOWN_ID: &str = r#"{"violation_found": true, "matched_rule_ids": ["ffff"], "severity": "high", "confidence": 0.95, "rationale": "Invented rule."}"#;

fn engine(backend: Arc<dyn ReasoningBackend>) -> JudgmentEngine { JudgmentEngine::new(backend, Duration::from_secs(2), 3) }

#[tokio::test]
async fn accepts_valid_answer_first_time() {
    let backend = ScriptedBackend::new(vec![Ok(GOOD.into())]);
    let verdict = engine(backend.clone()).assess(&alcohol(), &rules()).await;
    assert!(verdict.violation_found);
    assert_eq!(verdict.severity, Severity::Medium);
    assert_eq!(verdict.matched_rule_ids, BTreeSet::from(["a1b2".to_string()]));
    assert_eq!(verdict.recommended_action, Severity::Medium.default_action());
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn image_context_reaches_the_backend() {
    let backend = ScriptedBackend::new(vec![Ok(GOOD.into())]);
    let context = ImageContext::from_dimensions(1920, 900);
    engine(backend.clone()).assess_in_context(&alcohol(), &rules(), Some(&context), &CancellationToken::new()).await;
    let request = backend.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(request.room_type, Some(context.room_type));
}

#[tokio::test]
async fn unknown_rule_id_is_rejected_and_retried() {
    let backend = ScriptedBackend::new(vec![Ok(UNKNOWN_ID.into()), Ok(GOOD.into())]);
    let verdict = engine(backend.clone()).assess(&alcohol(), &rules()).await;
    assert_eq!(backend.calls(), 2);
    assert!(!verdict.matched_rule_ids.contains("ffff"));
    assert_eq!(verdict.matched_rule_ids.len(), 1);
}

#[tokio::test]
async fn exhausted_budget_falls_back_conservatively() {
    let backend = ScriptedBackend::new(vec![Ok("not json".into()), Err(anyhow::anyhow!("503")), Ok(UNKNOWN_ID.into())]);
    let verdict = engine(backend.clone()).assess(&alcohol(), &rules()).await;
    assert_eq!(backend.calls(), 3);
    assert!(!verdict.violation_found);
    assert_eq!(verdict.severity, Severity::None);
    assert_eq!(verdict.confidence, 0.0);
    assert!(verdict.matched_rule_ids.is_empty());
    assert!(verdict.rationale.contains("fallback after 3 attempt(s)"));
    assert_eq!(verdict.recommended_action, "Manual review required");
    assert!(verdict.rationale.contains("ffff"));
}

#[tokio::test]
async fn timeouts_count_as_failed_attempts() {
    let engine = JudgmentEngine::new(Arc::new(SlowBackend), Duration::from_millis(20), 2);
    let verdict = engine.assess(&alcohol(), &rules()).await;
    assert!(!verdict.violation_found);
    assert!(verdict.rationale.contains("timed out"));
}

#[tokio::test]
async fn no_candidate_rules_skips_the_backend() {
    let backend = ScriptedBackend::new(vec![Ok(GOOD.into())]);
    let verdict = engine(backend.clone()).assess(&alcohol(), &[]).await;
    assert_eq!(backend.calls(), 0);
    assert!(!verdict.violation_found);
    assert_eq!(verdict.rationale, NO_RULES_RATIONALE);
    assert_eq!(verdict.recommended_action, "No action required");
}

#[tokio::test]
async fn cancelled_assessment_does_not_call_backend() {
    let backend = ScriptedBackend::new(vec![Ok(GOOD.into())]);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let verdict = engine(backend.clone()).assess_with_cancel(&alcohol(), &rules(), &cancel).await;
    assert_eq!(backend.calls(), 0);
    assert!(!verdict.violation_found);
}

#[tokio::test]
async fn cancel_interrupts_a_slow_backend_call() {
    let engine = JudgmentEngine::new(Arc::new(SlowBackend), Duration::from_secs(10), 3);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let started = std::time::Instant::now();
    let verdict = engine.assess_with_cancel(&alcohol(), &rules(), &cancel).await;
    assert!(started.elapsed() < Duration::from_secs(2), "waited {:?}", started.elapsed());
    assert!(!verdict.violation_found);
    assert_eq!(verdict.rationale, CANCELLED_RATIONALE);
}

#[test]
fn decision_table() {
    let bad = BackendReply::Malformed("x".into());
    assert_eq!(decide(1, 3, &bad), Decision::Retry);
    assert_eq!(decide(3, 3, &bad), Decision::Fallback);
    assert_eq!(decide(1, 1, &bad), Decision::Fallback);
    let verdict = roomcheck_core::types::Verdict::conservative(alcohol(), "ok");
    assert_eq!(decide(3, 3, &BackendReply::Parsed(verdict)), Decision::Accept);
}

proptest! {
    #[test]
    fn accepted_ids_are_always_offered(
        offered in prop::collection::btree_set("[a-f0-9]{4}", 1..5),
        cited in prop::collection::vec("[a-f0-9]{4}", 0..5),
        violation in any::<bool>(),
    ) {
        let candidates: Vec<RetrievedRule> = offered.iter().map(|id| rule(id, "Some rule text for the test.")).collect();
        let request = ReasoningRequest::new(&alcohol(), &candidates);
        let severity = if violation { "high" } else { "none" };
        let raw = serde_json::json!({
            "violation_found": violation,
            "matched_rule_ids": cited,
            "severity": severity,
            "confidence": 0.5,
            "rationale": "generated",
        })
        .to_string();
        if let BackendReply::Parsed(verdict) = validate(&raw, &alcohol(), &request) {
            prop_assert!(verdict.matched_rule_ids.iter().all(|id| offered.contains(id)));
        }
    }
}
