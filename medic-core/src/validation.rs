//! Intake validation for inbound kill reports.
//!
//! Pure functions: each validator returns the normalized value or a
//! [`ValidationFailure`] naming the offending field. Failures are terminal
//! for the record (recorded as Undetermined with reason `invalid_input` and
//! acked) but never block the pipeline.

use crate::error::ValidationFailure;
use crate::types::KillReport;
use regex::Regex;
use std::sync::OnceLock;

/// Maximum number of evidence items per report.
pub const MAX_EVIDENCE_ITEMS: usize = 100;
/// Maximum size of a single evidence item, in bytes.
pub const MAX_EVIDENCE_ITEM_BYTES: usize = 10 * 1024;
/// Maximum canonical-JSON size of the metadata map, in bytes.
pub const MAX_METADATA_BYTES: usize = 100 * 1024;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,254}$").expect("valid regex"))
}

/// Validate a module or instance identifier.
///
/// Accepts `[A-Za-z0-9][A-Za-z0-9_.\-]{0,254}`; rejects `..`, path
/// separators, and NUL bytes regardless of the pattern.
pub fn validate_name(field: &str, value: &str) -> Result<String, ValidationFailure> {
    if value.contains('\0') {
        return Err(ValidationFailure::new(field, "contains NUL byte"));
    }
    if value.contains('/') || value.contains('\\') {
        return Err(ValidationFailure::new(field, "contains path separator"));
    }
    if value.contains("..") {
        return Err(ValidationFailure::new(field, "contains '..'"));
    }
    if !name_pattern().is_match(value) {
        return Err(ValidationFailure::new(
            field,
            "must match [A-Za-z0-9][A-Za-z0-9_.-]{0,254}",
        ));
    }
    Ok(value.to_string())
}

/// Validate a score that must lie in [0, 1]. Bounds are accepted; anything
/// outside (or NaN) is an error.
pub fn validate_score(field: &str, value: f64) -> Result<f64, ValidationFailure> {
    if value.is_nan() {
        return Err(ValidationFailure::new(field, "is NaN"));
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(ValidationFailure::new(
            field,
            format!("{value} is outside [0.0, 1.0]"),
        ));
    }
    Ok(value)
}

/// Validate the evidence list: at most 100 items, each at most 10 KiB.
pub fn validate_evidence(evidence: &[String]) -> Result<(), ValidationFailure> {
    if evidence.len() > MAX_EVIDENCE_ITEMS {
        return Err(ValidationFailure::new(
            "evidence",
            format!("{} items exceeds limit of {MAX_EVIDENCE_ITEMS}", evidence.len()),
        ));
    }
    for (i, item) in evidence.iter().enumerate() {
        if item.len() > MAX_EVIDENCE_ITEM_BYTES {
            return Err(ValidationFailure::new(
                "evidence",
                format!(
                    "item {i} is {} bytes, limit is {MAX_EVIDENCE_ITEM_BYTES}",
                    item.len()
                ),
            ));
        }
    }
    Ok(())
}

/// Validate the metadata map: canonical serialization must fit in 100 KiB.
///
/// `serde_json`'s map keeps keys sorted, so `to_string` is already the
/// canonical form.
pub fn validate_metadata(
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), ValidationFailure> {
    let canonical = serde_json::to_string(metadata)
        .map_err(|e| ValidationFailure::new("metadata", format!("not serializable: {e}")))?;
    if canonical.len() > MAX_METADATA_BYTES {
        return Err(ValidationFailure::new(
            "metadata",
            format!(
                "canonical form is {} bytes, limit is {MAX_METADATA_BYTES}",
                canonical.len()
            ),
        ));
    }
    Ok(())
}

/// Validate a whole kill report at intake. Enum fields (`kill_reason`,
/// `severity`) are strict at the wire and already checked by deserialization.
pub fn validate_kill_report(report: &KillReport) -> Result<(), ValidationFailure> {
    if report.kill_id.is_empty() {
        return Err(ValidationFailure::new("kill_id", "must not be empty"));
    }
    if report.source_agent.is_empty() {
        return Err(ValidationFailure::new("source_agent", "must not be empty"));
    }
    validate_name("target_module", &report.target_module)?;
    validate_name("target_instance_id", &report.target_instance_id)?;
    validate_score("confidence_score", report.confidence_score)?;
    validate_evidence(&report.evidence)?;
    for dep in &report.dependencies {
        validate_name("dependencies", dep)?;
    }
    validate_metadata(&report.metadata)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_accepts_typical_container_names() {
        for name in ["nginx-test", "api_v2", "a", "svc.prod-1", "0db"] {
            assert!(validate_name("target_module", name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_name_rejects_traversal_and_separators() {
        for name in ["../etc", "a/b", "a\\b", "a..b", "", "-leading", ".hidden"] {
            assert!(validate_name("target_module", name).is_err(), "{name}");
        }
        assert!(validate_name("target_module", "nul\0byte").is_err());
    }

    #[test]
    fn test_name_rejects_overlong() {
        let name = "a".repeat(256);
        assert!(validate_name("target_module", &name).is_err());
        let name = "a".repeat(255);
        assert!(validate_name("target_module", &name).is_ok());
    }

    #[test]
    fn test_score_bounds_accepted() {
        assert_eq!(validate_score("confidence_score", 0.0).unwrap(), 0.0);
        assert_eq!(validate_score("confidence_score", 1.0).unwrap(), 1.0);
    }

    #[test]
    fn test_score_outside_rejected() {
        assert!(validate_score("confidence_score", -0.0001).is_err());
        assert!(validate_score("confidence_score", 1.0001).is_err());
        assert!(validate_score("confidence_score", f64::NAN).is_err());
    }

    #[test]
    fn test_evidence_at_caps() {
        let item = "x".repeat(MAX_EVIDENCE_ITEM_BYTES);
        let evidence = vec![item.clone(); MAX_EVIDENCE_ITEMS];
        assert!(validate_evidence(&evidence).is_ok());

        let too_many = vec![item.clone(); MAX_EVIDENCE_ITEMS + 1];
        assert!(validate_evidence(&too_many).is_err());

        let too_big = vec!["x".repeat(MAX_EVIDENCE_ITEM_BYTES + 1)];
        assert!(validate_evidence(&too_big).is_err());
    }

    #[test]
    fn test_metadata_size_cap() {
        let mut small = serde_json::Map::new();
        small.insert("zone".into(), serde_json::json!("eu-1"));
        assert!(validate_metadata(&small).is_ok());

        let mut big = serde_json::Map::new();
        big.insert("blob".into(), serde_json::json!("y".repeat(MAX_METADATA_BYTES)));
        assert!(validate_metadata(&big).is_err());
    }

    fn sample_report() -> KillReport {
        serde_json::from_value(serde_json::json!({
            "kill_id": "k-1",
            "timestamp": "2026-02-11T08:30:00Z",
            "target_module": "nginx-test",
            "target_instance_id": "nginx-test-1",
            "kill_reason": "anomaly_behavior",
            "severity": "low",
            "confidence_score": 0.4,
            "evidence": ["unusual_traffic"],
            "dependencies": ["redis-cache"],
            "source_agent": "killer-1"
        }))
        .unwrap()
    }

    #[test]
    fn test_full_report_passes() {
        assert!(validate_kill_report(&sample_report()).is_ok());
    }

    #[test]
    fn test_full_report_bad_module() {
        let mut report = sample_report();
        report.target_module = "../escape".into();
        let err = validate_kill_report(&report).unwrap_err();
        assert_eq!(err.field, "target_module");
    }

    #[test]
    fn test_full_report_bad_dependency() {
        let mut report = sample_report();
        report.dependencies = vec!["ok".into(), "bad/dep".into()];
        let err = validate_kill_report(&report).unwrap_err();
        assert_eq!(err.field, "dependencies");
    }

    #[test]
    fn test_full_report_empty_kill_id() {
        let mut report = sample_report();
        report.kill_id = String::new();
        assert!(validate_kill_report(&report).is_err());
    }
}
