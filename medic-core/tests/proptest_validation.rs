//! Property-based tests for intake validation and scoring bounds.

use medic_core::engine::DecisionEngine;
use medic_core::types::{KillReason, KillReport, OperatingMode, RiskLevel, Severity, SiemResult};
use medic_core::validation::{
    MAX_EVIDENCE_ITEM_BYTES, MAX_EVIDENCE_ITEMS, validate_evidence, validate_name, validate_score,
};
use medic_core::MedicConfig;
use proptest::prelude::*;

// --- Name validation properties ---

proptest! {
    #[test]
    fn valid_names_are_accepted(name in "[A-Za-z0-9][A-Za-z0-9_]{0,63}") {
        prop_assert!(validate_name("target_module", &name).is_ok());
    }

    #[test]
    fn names_with_separators_are_rejected(
        prefix in "[A-Za-z0-9]{1,8}",
        suffix in "[A-Za-z0-9]{1,8}",
        sep in prop::sample::select(vec!["/", "\\", "..", "\0"]),
    ) {
        let name = format!("{prefix}{sep}{suffix}");
        prop_assert!(validate_name("target_module", &name).is_err());
    }

    #[test]
    fn accepted_names_round_trip_unchanged(name in "[A-Za-z0-9][A-Za-z0-9_.\\-]{0,100}") {
        if let Ok(normalized) = validate_name("target_module", &name) {
            prop_assert_eq!(normalized, name);
        }
    }
}

// --- Score validation properties ---

proptest! {
    #[test]
    fn in_range_scores_accepted(score in 0.0f64..=1.0) {
        prop_assert_eq!(validate_score("confidence_score", score).unwrap(), score);
    }

    #[test]
    fn out_of_range_scores_rejected(score in prop::num::f64::ANY) {
        prop_assume!(!(0.0..=1.0).contains(&score) || score.is_nan());
        prop_assert!(validate_score("confidence_score", score).is_err());
    }
}

// --- Evidence cap properties ---

proptest! {
    #[test]
    fn evidence_within_caps_accepted(count in 0usize..=20, item_len in 0usize..=256) {
        let evidence = vec!["x".repeat(item_len); count];
        prop_assert!(validate_evidence(&evidence).is_ok());
    }

    #[test]
    fn evidence_over_item_cap_rejected(extra in 1usize..=64) {
        let evidence = vec!["x".repeat(MAX_EVIDENCE_ITEM_BYTES + extra)];
        prop_assert!(validate_evidence(&evidence).is_err());
    }

    #[test]
    fn evidence_over_count_cap_rejected(extra in 1usize..=8) {
        let evidence = vec!["e".to_string(); MAX_EVIDENCE_ITEMS + extra];
        prop_assert!(validate_evidence(&evidence).is_err());
    }
}

// --- Engine bounds properties ---

fn arbitrary_report(confidence: f64, evidence: usize, severity: Severity) -> KillReport {
    KillReport {
        kill_id: "prop".to_string(),
        timestamp: chrono::Utc::now(),
        target_module: "module".to_string(),
        target_instance_id: "module-1".to_string(),
        kill_reason: KillReason::AnomalyBehavior,
        severity,
        confidence_score: confidence,
        evidence: vec!["e".to_string(); evidence],
        dependencies: vec![],
        source_agent: "killer".to_string(),
        metadata: serde_json::Map::new(),
    }
}

fn severity_strategy() -> impl Strategy<Value = Severity> {
    prop::sample::select(vec![
        Severity::Info,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ])
}

proptest! {
    /// Risk score and confidence always land in [0, 1], and the risk level
    /// band always matches the score, whatever the inputs.
    #[test]
    fn scores_and_bands_stay_in_range(
        killer_confidence in 0.0f64..=1.0,
        siem_risk in 0.0f64..=1.0,
        fp in 0u32..=50,
        history in 0u64..=50,
        evidence in 0usize..=10,
        severity in severity_strategy(),
    ) {
        let engine = DecisionEngine::new(&MedicConfig::default(), OperatingMode::Live).unwrap();
        let report = arbitrary_report(killer_confidence, evidence, severity);
        let siem = SiemResult {
            risk_score: siem_risk,
            false_positive_history: fp,
            recommendation: String::new(),
        };
        let decision = engine.decide(&report, &siem, history);
        prop_assert!((0.0..=1.0).contains(&decision.risk_score));
        prop_assert!((0.0..=1.0).contains(&decision.confidence));
        prop_assert_eq!(decision.risk_level, RiskLevel::from_score(decision.risk_score));
    }

    /// More false-positive history never raises the risk score.
    #[test]
    fn fp_history_is_monotonically_risk_reducing(
        killer_confidence in 0.0f64..=1.0,
        siem_risk in 0.0f64..=1.0,
        fp_low in 0u32..=20,
        fp_extra in 0u32..=20,
        severity in severity_strategy(),
    ) {
        let engine = DecisionEngine::new(&MedicConfig::default(), OperatingMode::Live).unwrap();
        let report = arbitrary_report(killer_confidence, 0, severity);
        let low = SiemResult {
            risk_score: siem_risk,
            false_positive_history: fp_low,
            recommendation: String::new(),
        };
        let high = SiemResult {
            risk_score: siem_risk,
            false_positive_history: fp_low + fp_extra,
            recommendation: String::new(),
        };
        let (risk_low, _) = engine.score(&report, &low, 0);
        let (risk_high, _) = engine.score(&report, &high, 0);
        prop_assert!(risk_high <= risk_low + 1e-12);
    }
}
