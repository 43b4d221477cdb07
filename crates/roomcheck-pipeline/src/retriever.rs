use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use roomcheck_core::types::{Detection, RetrievedRule};
use roomcheck_core::Result;
use roomcheck_index::RuleIndex;

/// Per-label rule lookups against one built index.
pub struct RuleRetriever {
    index: Arc<RuleIndex>,
    use_category_hint: bool,
}

impl RuleRetriever {
    pub fn new(index: Arc<RuleIndex>, use_category_hint: bool) -> Self { Self { index, use_category_hint } }

    pub fn query_text(&self, detection: &Detection) -> String {
        if self.use_category_hint {
            format!("{} {}", detection.label, detection.category.hint())
        } else {
            detection.label.clone()
        }
    }

    /// Top `k_per_label` rules for every distinct label, unique by fragment id within a label.
    pub fn retrieve_for(&self, detections: &[Detection], k_per_label: usize) -> Result<BTreeMap<String, Vec<RetrievedRule>>> {
        let mut out = BTreeMap::new();
        for detection in detections {
            if out.contains_key(&detection.label) {
                continue;
            }
            let mut seen = HashSet::new();
            let rules: Vec<RetrievedRule> = self
                .index
                .query(&self.query_text(detection), k_per_label)?
                .into_iter()
                .filter(|r| seen.insert(r.fragment.id.clone()))
                .collect();
            debug!(label = %detection.label, rules = rules.len(), "retrieved rules");
            out.insert(detection.label.clone(), rules);
        }
        Ok(out)
    }
}
