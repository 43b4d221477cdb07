//! Strict validation of raw backend answers.

use serde::Deserialize;
use std::collections::BTreeSet;

use roomcheck_core::types::{Detection, Severity, Verdict};

use crate::request::ReasoningRequest;

/// Outcome of one backend round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendReply {
    Parsed(Verdict),
    Malformed(String),
}

impl BackendReply {
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Parsed(_) => None,
            Self::Malformed(reason) => Some(reason),
        }
    }
}

// Extra keys are tolerated; every key listed here is required except the action.
#[derive(Deserialize)]
struct RawAnswer {
    violation_found: bool,
    matched_rule_ids: Vec<String>,
    severity: String,
    confidence: f64,
    rationale: String,
    #[serde(default)]
    recommended_action: Option<String>,
}

/// Outermost `{ ... }` span of `raw`, so prose or code fences around the object are ignored.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// Turn raw backend text into a verdict about `subject`, or say why it cannot be trusted.
pub fn validate(raw: &str, subject: &Detection, request: &ReasoningRequest) -> BackendReply {
    match parse(raw, subject, request) {
        Ok(verdict) => BackendReply::Parsed(verdict),
        Err(reason) => BackendReply::Malformed(reason),
    }
}

fn parse(raw: &str, subject: &Detection, request: &ReasoningRequest) -> Result<Verdict, String> {
    let json = extract_json_object(raw).ok_or_else(|| "no JSON object in reply".to_string())?;
    let answer: RawAnswer = serde_json::from_str(json).map_err(|e| format!("reply does not match verdict schema: {e}"))?;

    let severity: Severity = answer.severity.parse()?;
    if !answer.confidence.is_finite() || !(0.0..=1.0).contains(&answer.confidence) {
        return Err(format!("confidence {} outside [0,1]", answer.confidence));
    }
    let offered = request.offered_ids();
    if let Some(unknown) = answer.matched_rule_ids.iter().find(|id| !offered.contains(id.as_str())) {
        return Err(format!("reply cites rule id '{unknown}' that was not offered"));
    }
    if answer.violation_found && severity == Severity::None {
        return Err("violation reported with severity none".into());
    }
    if answer.violation_found && answer.matched_rule_ids.is_empty() {
        return Err("violation reported without a matched rule".into());
    }
    if !answer.violation_found && severity != Severity::None {
        return Err(format!("no violation reported but severity is {severity}"));
    }
    let rationale = answer.rationale.trim();
    if rationale.is_empty() {
        return Err("empty rationale".into());
    }
    let recommended_action = answer
        .recommended_action
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| severity.default_action())
        .to_string();
    Ok(Verdict {
        subject: subject.clone(),
        violation_found: answer.violation_found,
        matched_rule_ids: answer.matched_rule_ids.into_iter().collect::<BTreeSet<_>>(),
        severity,
        confidence: answer.confidence as f32,
        rationale: rationale.to_string(),
        recommended_action,
    })
}
