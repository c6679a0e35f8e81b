//! Data model for the resurrection pipeline.
//!
//! Kill reports are ephemeral inbound events; decisions and outcome records
//! are permanent once written. All wire types serialize with `serde` using
//! snake_case enum encodings to match the upstream killer's payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why the upstream killer terminated a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    ThreatDetected,
    AnomalyBehavior,
    PolicyViolation,
    ResourceExhaustion,
    DependencyCascade,
    ManualOverride,
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ThreatDetected => write!(f, "threat_detected"),
            Self::AnomalyBehavior => write!(f, "anomaly_behavior"),
            Self::PolicyViolation => write!(f, "policy_violation"),
            Self::ResourceExhaustion => write!(f, "resource_exhaustion"),
            Self::DependencyCascade => write!(f, "dependency_cascade"),
            Self::ManualOverride => write!(f, "manual_override"),
        }
    }
}

/// Severity as reported by the killer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    /// Contribution of this severity to the risk factor in [0, 1].
    pub fn factor(&self) -> f64 {
        match self {
            Severity::Info => 0.0,
            Severity::Low => 0.25,
            Severity::Medium => 0.5,
            Severity::High => 0.75,
            Severity::Critical => 1.0,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
            Severity::Info => write!(f, "info"),
        }
    }
}

/// An inbound kill notification. Immutable after intake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillReport {
    /// Globally unique, client-supplied identity.
    pub kill_id: String,
    /// When the kill happened.
    pub timestamp: DateTime<Utc>,
    /// Container name of the terminated module. Validated at intake.
    pub target_module: String,
    /// Instance identity within the module. Validated at intake.
    pub target_instance_id: String,
    pub kill_reason: KillReason,
    pub severity: Severity,
    /// Killer's confidence that the kill was justified, in [0, 1].
    pub confidence_score: f64,
    /// Ordered evidence strings (at most 100 items of at most 10 KiB each).
    pub evidence: Vec<String>,
    /// Modules the target depends on, in the killer's dependency order.
    pub dependencies: Vec<String>,
    pub source_agent: String,
    /// Free-form metadata. Canonical serialization capped at 100 KiB.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Enrichment returned by the SIEM, or the no-op sentinel when enrichment
/// is disabled or unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiemResult {
    /// SIEM's own risk assessment in [0, 1].
    pub risk_score: f64,
    /// How many times this module was killed on a false positive before.
    pub false_positive_history: u32,
    /// Free-text recommendation, truncated to 1 KiB on receipt.
    pub recommendation: String,
}

impl SiemResult {
    /// The neutral sentinel used when enrichment is disabled or the SIEM
    /// cannot be reached.
    pub fn noop() -> Self {
        Self {
            risk_score: 0.5,
            false_positive_history: 0,
            recommendation: String::new(),
        }
    }
}

/// What the decision engine concluded for one kill report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Resurrect without human confirmation.
    ApproveAuto,
    /// Resurrected after a human approved via the HTTP surface.
    ApproveManual,
    /// Waiting for a human in the pending queue.
    PendingReview,
    /// The kill stands; do not resurrect.
    Deny,
    /// Decision postponed (not produced by classification today).
    Defer,
}

impl std::fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApproveAuto => write!(f, "approve_auto"),
            Self::ApproveManual => write!(f, "approve_manual"),
            Self::PendingReview => write!(f, "pending_review"),
            Self::Deny => write!(f, "deny"),
            Self::Defer => write!(f, "defer"),
        }
    }
}

/// Risk band for a scored kill report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Classify a risk score into its band.
    pub fn from_score(score: f64) -> Self {
        if score < 0.2 {
            RiskLevel::Minimal
        } else if score < 0.4 {
            RiskLevel::Low
        } else if score < 0.6 {
            RiskLevel::Medium
        } else if score < 0.8 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Minimal => write!(f, "minimal"),
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// The engine's verdict on one kill report. Created atomically, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: Uuid,
    pub kill_id: String,
    pub outcome: DecisionOutcome,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub confidence: f64,
    /// Human-readable reasoning, one line per contributing factor or rule.
    pub reasoning: Vec<String>,
    pub requires_human_review: bool,
    /// Validity window for a PendingReview decision, in minutes.
    pub timeout_minutes: u32,
    pub decided_at: DateTime<Utc>,
}

/// Terminal result of acting (or declining to act) on a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    Success,
    PartialSuccess,
    Failure,
    ReKilled,
    Rollback,
    Undetermined,
}

impl OutcomeType {
    /// Stable string used in the outcome store and on the HTTP surface.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeType::Success => "success",
            OutcomeType::PartialSuccess => "partial_success",
            OutcomeType::Failure => "failure",
            OutcomeType::ReKilled => "re_killed",
            OutcomeType::Rollback => "rollback",
            OutcomeType::Undetermined => "undetermined",
        }
    }

    /// Inverse of [`OutcomeType::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(OutcomeType::Success),
            "partial_success" => Some(OutcomeType::PartialSuccess),
            "failure" => Some(OutcomeType::Failure),
            "re_killed" => Some(OutcomeType::ReKilled),
            "rollback" => Some(OutcomeType::Rollback),
            "undetermined" => Some(OutcomeType::Undetermined),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutcomeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a decision and its result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub outcome_id: Uuid,
    pub decision_id: Uuid,
    pub kill_id: String,
    pub target_module: String,
    pub outcome_type: OutcomeType,
    pub was_auto_approved: bool,
    pub original_risk_score: f64,
    pub original_confidence: f64,
    /// Seconds from restart to healthy; absent when no restart happened.
    pub time_to_healthy_seconds: Option<f64>,
    /// Post-restart health score in [0, 1]; absent when no restart happened.
    pub health_score_after: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl OutcomeRecord {
    /// Build a record for a decision, stamping identity and time.
    pub fn for_decision(
        decision: &Decision,
        target_module: &str,
        outcome_type: OutcomeType,
        time_to_healthy_seconds: Option<f64>,
        health_score_after: Option<f64>,
        was_auto_approved: bool,
    ) -> Self {
        Self {
            outcome_id: Uuid::new_v4(),
            decision_id: decision.decision_id,
            kill_id: decision.kill_id.clone(),
            target_module: target_module.to_string(),
            outcome_type,
            was_auto_approved,
            original_risk_score: decision.risk_score,
            original_confidence: decision.confidence,
            time_to_healthy_seconds,
            health_score_after,
            recorded_at: Utc::now(),
        }
    }
}

/// Whether classification leads to action or is purely advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Classify but never act.
    Observer,
    /// Classify and act subject to auto-approval rules.
    Live,
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatingMode::Observer => write!(f, "observer"),
            OperatingMode::Live => write!(f, "live"),
        }
    }
}

impl std::str::FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "observer" => Ok(OperatingMode::Observer),
            "live" => Ok(OperatingMode::Live),
            other => Err(format!("unknown mode '{other}' (expected observer|live)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_report_round_trip() {
        let json = r#"{
            "kill_id": "k-42",
            "timestamp": "2026-02-11T08:30:00Z",
            "target_module": "nginx-edge",
            "target_instance_id": "nginx-edge-7f9b",
            "kill_reason": "anomaly_behavior",
            "severity": "low",
            "confidence_score": 0.4,
            "evidence": ["unusual_traffic"],
            "dependencies": [],
            "source_agent": "killer-1",
            "metadata": {"zone": "eu-1"}
        }"#;
        let report: KillReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.kill_id, "k-42");
        assert_eq!(report.kill_reason, KillReason::AnomalyBehavior);
        assert_eq!(report.severity, Severity::Low);

        let encoded = serde_json::to_string(&report).unwrap();
        let decoded: KillReport = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.kill_id, report.kill_id);
        assert_eq!(decoded.metadata, report.metadata);
        assert_eq!(decoded.timestamp, report.timestamp);
    }

    #[test]
    fn test_metadata_defaults_empty() {
        let json = r#"{
            "kill_id": "k-1",
            "timestamp": "2026-02-11T08:30:00Z",
            "target_module": "api",
            "target_instance_id": "api-1",
            "kill_reason": "threat_detected",
            "severity": "critical",
            "confidence_score": 1.0,
            "evidence": [],
            "dependencies": [],
            "source_agent": "killer-1"
        }"#;
        let report: KillReport = serde_json::from_str(json).unwrap();
        assert!(report.metadata.is_empty());
    }

    #[test]
    fn test_risk_level_bands() {
        assert_eq!(RiskLevel::from_score(0.0), RiskLevel::Minimal);
        assert_eq!(RiskLevel::from_score(0.19), RiskLevel::Minimal);
        assert_eq!(RiskLevel::from_score(0.2), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(0.4), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.6), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.8), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(1.0), RiskLevel::Critical);
    }

    #[test]
    fn test_severity_factor_boundaries() {
        assert_eq!(Severity::Info.factor(), 0.0);
        assert_eq!(Severity::Critical.factor(), 1.0);
        assert_eq!(Severity::Medium.factor(), 0.5);
    }

    #[test]
    fn test_outcome_type_str_round_trip() {
        for t in [
            OutcomeType::Success,
            OutcomeType::PartialSuccess,
            OutcomeType::Failure,
            OutcomeType::ReKilled,
            OutcomeType::Rollback,
            OutcomeType::Undetermined,
        ] {
            assert_eq!(OutcomeType::parse(t.as_str()), Some(t));
        }
        assert_eq!(OutcomeType::parse("nope"), None);
    }

    #[test]
    fn test_siem_noop_sentinel() {
        let noop = SiemResult::noop();
        assert_eq!(noop.risk_score, 0.5);
        assert_eq!(noop.false_positive_history, 0);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("live".parse::<OperatingMode>().unwrap(), OperatingMode::Live);
        assert!("prod".parse::<OperatingMode>().is_err());
    }
}
