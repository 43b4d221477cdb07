//! What the reasoning backend is asked, and how the question is worded.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use roomcheck_core::types::{Detection, FragmentId, ObjectCategory, RetrievedRule, RoomType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRule {
    pub id: FragmentId,
    pub text: String,
}

/// One bounded question about one detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub label: String,
    pub category: ObjectCategory,
    pub detection_confidence: f32,
    pub candidate_rules: Vec<CandidateRule>,
    /// Scene guessed from the photo, when known.
    pub room_type: Option<RoomType>,
}

impl ReasoningRequest {
    /// Candidate rules keep retrieval order; repeated fragment ids are offered once.
    pub fn new(detection: &Detection, rules: &[RetrievedRule]) -> Self {
        let mut seen = HashSet::new();
        let candidate_rules = rules
            .iter()
            .filter(|r| seen.insert(r.fragment.id.as_str()))
            .map(|r| CandidateRule { id: r.fragment.id.clone(), text: r.fragment.text.clone() })
            .collect();
        Self {
            label: detection.label.clone(),
            category: detection.category,
            detection_confidence: detection.confidence,
            candidate_rules,
            room_type: None,
        }
    }

    pub fn with_room_type(mut self, room_type: Option<RoomType>) -> Self {
        self.room_type = room_type;
        self
    }

    pub fn offered_ids(&self) -> HashSet<&str> { self.candidate_rules.iter().map(|c| c.id.as_str()).collect() }
}

const INSTRUCTIONS: &str = "You are a housing policy compliance officer. Decide whether the object \
detected in a residence hall room violates any of the policy rules listed below. Only the listed \
rules count. If no listed rule clearly applies, report no violation.

Answer with a single JSON object and nothing else:
{\"violation_found\": true|false, \"matched_rule_ids\": [\"<rule id>\", ...], \
\"severity\": \"none\"|\"low\"|\"medium\"|\"high\", \"confidence\": <number 0.0-1.0>, \
\"rationale\": \"<one or two sentences>\", \"recommended_action\": \"<what staff should do>\"}

matched_rule_ids may only contain ids from the list below. A violation needs at least one \
matched rule and a severity other than none. No violation means severity none.";

/// Instruction-formatted prompt for text generation backends.
pub fn render_prompt(request: &ReasoningRequest) -> String {
    let mut rules = String::new();
    for rule in &request.candidate_rules {
        rules.push_str(&format!("- [{}] {}\n", rule.id, rule.text));
    }
    let ids: Vec<&str> = request.candidate_rules.iter().map(|c| c.id.as_str()).collect();
    let context = request.room_type.map(|r| format!("Image context: {r}\n")).unwrap_or_default();
    format!(
        "<|system|>\n{INSTRUCTIONS}\n</s>\n<|user|>\nDetected object: {} (category: {}, detector confidence: {:.2})\n{context}\nPolicy rules:\n{rules}\nAllowed rule ids: {}\n</s>\n<|assistant|>\n",
        request.label,
        request.category.hint(),
        request.detection_confidence,
        ids.join(", ")
    )
}
