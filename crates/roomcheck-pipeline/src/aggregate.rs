use std::collections::BTreeSet;

use roomcheck_core::types::{IncidentAssessment, Severity, Verdict, NO_ACTION};

/// Fold per-object verdicts into the incident verdict. Verdict order is kept for display.
///
/// The incident action comes from the most confident violation at the dominant
/// severity; equal confidences pick the lexicographically first action, so the
/// result does not depend on verdict order.
pub fn aggregate(verdicts: Vec<Verdict>) -> IncidentAssessment {
    let violation_found = verdicts.iter().any(|v| v.violation_found);
    let dominant_severity = verdicts
        .iter()
        .filter(|v| v.violation_found)
        .map(|v| v.severity)
        .max()
        .unwrap_or(Severity::None);
    let consolidated_rules: BTreeSet<_> = verdicts.iter().flat_map(|v| v.matched_rule_ids.iter().cloned()).collect();
    let recommended_action = verdicts
        .iter()
        .filter(|v| v.violation_found && v.severity == dominant_severity)
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence).then_with(|| b.recommended_action.cmp(&a.recommended_action)))
        .map_or(NO_ACTION, |v| v.recommended_action.as_str())
        .to_string();
    IncidentAssessment { violation_found, dominant_severity, verdicts, consolidated_rules, recommended_action }
}
