use proptest::prelude::*;

use roomcheck_core::types::{Detection, ObjectCategory, Severity, Verdict};
use roomcheck_pipeline::aggregate;

fn severity() -> impl Strategy<Value = Severity> {
    prop_oneof![Just(Severity::None), Just(Severity::Low), Just(Severity::Medium), Just(Severity::High)]
}

fn verdict() -> impl Strategy<Value = Verdict> {
    (
        any::<bool>(),
        severity(),
        prop::collection::btree_set("[a-f0-9]{4}", 0..3),
        prop_oneof![Just(0.5f32), Just(0.9f32)],
        prop_oneof![Just("Remove the item"), Just("Escalate"), Just("Document it")],
    )
        .prop_map(|(violation, severity, ids, confidence, action)| Verdict {
            subject: Detection::new("object", ObjectCategory::Other, 0.5),
            violation_found: violation,
            matched_rule_ids: ids,
            severity: if violation { severity } else { Severity::None },
            confidence,
            rationale: "generated".into(),
            recommended_action: action.into(),
        })
}

proptest! {
    #[test]
    fn reordering_verdicts_keeps_the_outcome(verdicts in prop::collection::vec(verdict(), 0..8), seed in any::<u64>()) {
        let mut shuffled = verdicts.clone();
        // deterministic permutation from the seed
        let n = shuffled.len();
        for i in (1..n).rev() {
            let j = (seed.wrapping_mul(i as u64 + 7) % (i as u64 + 1)) as usize;
            shuffled.swap(i, j);
        }
        let a = aggregate(verdicts.clone());
        let b = aggregate(shuffled);
        prop_assert_eq!(a.violation_found, b.violation_found);
        prop_assert_eq!(a.dominant_severity, b.dominant_severity);
        prop_assert_eq!(&a.consolidated_rules, &b.consolidated_rules);
        prop_assert_eq!(&a.recommended_action, &b.recommended_action);
        prop_assert_eq!(a.violation_found, verdicts.iter().any(|v| v.violation_found));
        prop_assert_eq!(a.verdicts, verdicts);
    }
}
