//! Risk scoring, decision classification, and threshold calibration.
//!
//! The engine is pure given its inputs: scoring and classification never
//! fail, and side effects are confined to logging. History comes in as a
//! plain count (the orchestrator queries the outcome store), so the engine
//! holds only a read-only view of the world.
//!
//! The auto-approval confidence bar is the one mutable piece: calibration
//! adjusts it from historical accuracy, and the HTTP surface reads it, so it
//! lives behind a shared lock.

use crate::config::{MedicConfig, RiskWeights};
use crate::error::ConfigError;
use crate::store::OutcomeStatistics;
use crate::types::{
    Decision, DecisionOutcome, KillReport, OperatingMode, RiskLevel, SiemResult,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// FP events at which the false-positive factor saturates.
const FP_SATURATION: f64 = 10.0;

/// Criticality factor for modules outside the critical set.
const NON_CRITICAL_FACTOR: f64 = 0.3;

/// Evidence boost: 0.05 per item, capped at 0.2.
const EVIDENCE_BOOST_PER_ITEM: f64 = 0.05;
const EVIDENCE_BOOST_CAP: f64 = 0.2;

/// Hard deny above this risk regardless of mode.
const DENY_RISK_FLOOR: f64 = 0.9;
/// Critical modules are denied from this risk upward.
const CRITICAL_DENY_RISK_FLOOR: f64 = 0.6;

/// Calibration policy constants.
const CALIBRATION_MIN_SAMPLES: u64 = 50;
const CALIBRATION_LOOSEN_ACCURACY: f64 = 0.95;
const CALIBRATION_TIGHTEN_ACCURACY: f64 = 0.80;
const CALIBRATION_LOOSEN_STEP: f64 = 0.02;
const CALIBRATION_TIGHTEN_STEP: f64 = 0.05;
const CONFIDENCE_FLOOR: f64 = 0.70;
const CONFIDENCE_CEILING: f64 = 0.99;

/// One applied calibration adjustment, for logging and the HTTP surface.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationChange {
    pub before: f64,
    pub after: f64,
    pub accuracy: f64,
    pub samples: u64,
}

/// The decision engine. One instance per process, driven by the
/// orchestrator; observer vs. live is a mode field, not a second engine.
pub struct DecisionEngine {
    weights: RiskWeights,
    mode: OperatingMode,
    auto_approve_enabled: bool,
    auto_max_risk: f64,
    auto_min_confidence: Arc<RwLock<f64>>,
    critical_modules: HashSet<String>,
    pending_timeout_minutes: u32,
    /// (auto_approved, auto_approved_successes) the last calibration acted
    /// on; an unchanged pair makes calibration a no-op.
    last_calibration_sample: Option<(u64, u64)>,
}

impl DecisionEngine {
    /// Build the engine from validated configuration. Refuses weights that
    /// do not sum to 1.0.
    pub fn new(config: &MedicConfig, mode: OperatingMode) -> Result<Self, ConfigError> {
        config.risk.weights.validate()?;
        Ok(Self {
            weights: config.risk.weights,
            mode,
            auto_approve_enabled: config.decision.auto_approve.enabled,
            auto_max_risk: config.decision.auto_approve.max_risk,
            auto_min_confidence: Arc::new(RwLock::new(config.decision.auto_approve.min_confidence)),
            critical_modules: config.critical_modules.iter().cloned().collect(),
            pending_timeout_minutes: config.decision.pending_timeout_minutes,
            last_calibration_sample: None,
        })
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Shared handle to the live confidence bar, for the HTTP surface.
    pub fn confidence_bar(&self) -> Arc<RwLock<f64>> {
        Arc::clone(&self.auto_min_confidence)
    }

    /// Current auto-approval confidence bar.
    pub fn auto_min_confidence(&self) -> f64 {
        *self.auto_min_confidence.read().expect("confidence bar lock")
    }

    /// Weighted risk score in [0, 1] plus per-factor reasoning lines.
    ///
    /// The false-positive factor enters as `1 - min(1, fp/10)`: a module
    /// with a history of false-positive kills scores as safer to resurrect.
    pub fn score(
        &self,
        report: &KillReport,
        siem: &SiemResult,
        module_history_count: u64,
    ) -> (f64, Vec<String>) {
        let w = &self.weights;

        let smith = report.confidence_score.clamp(0.0, 1.0);
        let siem_risk = siem.risk_score.clamp(0.0, 1.0);

        let fp_total = f64::from(siem.false_positive_history) + module_history_count as f64;
        let fp_factor = (fp_total / FP_SATURATION).min(1.0);
        let fp_contribution = 1.0 - fp_factor;

        let critical = self.critical_modules.contains(&report.target_module);
        let criticality = if critical { 1.0 } else { NON_CRITICAL_FACTOR };

        let severity = report.severity.factor();

        let score = (w.smith_confidence * smith
            + w.siem_risk * siem_risk
            + w.false_positive_history * fp_contribution
            + w.module_criticality * criticality
            + w.severity * severity)
            .clamp(0.0, 1.0);

        let reasoning = vec![
            format!("killer confidence {smith:.2} x {:.2}", w.smith_confidence),
            format!("siem risk {siem_risk:.2} x {:.2}", w.siem_risk),
            format!(
                "false-positive history {fp_total:.0} events -> factor {fp_contribution:.2} x {:.2}",
                w.false_positive_history
            ),
            format!(
                "module criticality {criticality:.2} ({}) x {:.2}",
                if critical { "critical" } else { "standard" },
                w.module_criticality
            ),
            format!(
                "severity {} -> {severity:.2} x {:.2}",
                report.severity, w.severity
            ),
        ];
        (score, reasoning)
    }

    /// Confidence in the classification, independent of the risk score's
    /// direction: `1 - |0.5 - risk| * 2 * (1 - evidence_boost)`.
    pub fn confidence(&self, risk_score: f64, evidence_len: usize) -> f64 {
        let boost = (EVIDENCE_BOOST_PER_ITEM * evidence_len as f64).min(EVIDENCE_BOOST_CAP);
        (1.0 - (0.5 - risk_score).abs() * 2.0 * (1.0 - boost)).clamp(0.0, 1.0)
    }

    /// Score and classify one enriched kill report into a decision.
    pub fn decide(
        &self,
        report: &KillReport,
        siem: &SiemResult,
        module_history_count: u64,
    ) -> Decision {
        let (risk_score, mut reasoning) = self.score(report, siem, module_history_count);
        let confidence = self.confidence(risk_score, report.evidence.len());
        let risk_level = RiskLevel::from_score(risk_score);
        let auto_min = self.auto_min_confidence();

        let auto_eligible = risk_score < self.auto_max_risk && confidence >= auto_min;
        let critical = self.critical_modules.contains(&report.target_module);

        let outcome = match self.mode {
            OperatingMode::Observer => {
                if auto_eligible {
                    reasoning.push("observer mode: would auto-approve, not acting".to_string());
                    DecisionOutcome::ApproveAuto
                } else {
                    self.classify_restricted(risk_score, critical, &mut reasoning)
                }
            }
            OperatingMode::Live if self.auto_approve_enabled && auto_eligible => {
                reasoning.push(format!(
                    "auto-approved: risk {risk_score:.3} < {:.2} and confidence {confidence:.3} >= {auto_min:.2}",
                    self.auto_max_risk
                ));
                DecisionOutcome::ApproveAuto
            }
            OperatingMode::Live => {
                if !self.auto_approve_enabled {
                    reasoning.push("auto-approval disabled".to_string());
                }
                self.classify_restricted(risk_score, critical, &mut reasoning)
            }
        };

        Decision {
            decision_id: Uuid::new_v4(),
            kill_id: report.kill_id.clone(),
            outcome,
            risk_level,
            risk_score,
            confidence,
            reasoning,
            requires_human_review: outcome == DecisionOutcome::PendingReview,
            timeout_minutes: self.pending_timeout_minutes,
            decided_at: Utc::now(),
        }
    }

    /// The non-auto branch: deny outright at extreme risk, deny critical
    /// modules earlier, defer to a human otherwise.
    fn classify_restricted(
        &self,
        risk_score: f64,
        critical: bool,
        reasoning: &mut Vec<String>,
    ) -> DecisionOutcome {
        if risk_score >= DENY_RISK_FLOOR {
            reasoning.push(format!("denied: risk {risk_score:.3} >= {DENY_RISK_FLOOR}"));
            DecisionOutcome::Deny
        } else if critical && risk_score >= CRITICAL_DENY_RISK_FLOOR {
            reasoning.push(format!(
                "denied: critical module at risk {risk_score:.3} >= {CRITICAL_DENY_RISK_FLOOR}"
            ));
            DecisionOutcome::Deny
        } else {
            reasoning.push("queued for human review".to_string());
            DecisionOutcome::PendingReview
        }
    }

    /// Adjust the confidence bar from recent auto-approval accuracy.
    ///
    /// Re-applying calibration over an unchanged window is a no-op: the
    /// engine remembers the sample pair it last acted on.
    pub fn calibrate(&mut self, stats: &OutcomeStatistics) -> Option<CalibrationChange> {
        let sample = (stats.auto_approved, stats.auto_approved_successes);
        if self.last_calibration_sample == Some(sample) {
            return None;
        }

        if stats.auto_approved < CALIBRATION_MIN_SAMPLES {
            info!(
                samples = stats.auto_approved,
                required = CALIBRATION_MIN_SAMPLES,
                "calibration skipped: not enough auto-approved outcomes"
            );
            return None;
        }
        self.last_calibration_sample = Some(sample);

        let accuracy = stats.auto_approve_accuracy;
        let before = self.auto_min_confidence();
        let after = if accuracy > CALIBRATION_LOOSEN_ACCURACY {
            (before - CALIBRATION_LOOSEN_STEP).max(CONFIDENCE_FLOOR)
        } else if accuracy < CALIBRATION_TIGHTEN_ACCURACY {
            (before + CALIBRATION_TIGHTEN_STEP).min(CONFIDENCE_CEILING)
        } else {
            before
        };

        if (after - before).abs() < f64::EPSILON {
            return None;
        }

        *self
            .auto_min_confidence
            .write()
            .expect("confidence bar lock") = after;

        if after < before {
            info!(before, after, accuracy, samples = stats.auto_approved, "calibration loosened auto-approval confidence bar");
        } else {
            warn!(before, after, accuracy, samples = stats.auto_approved, "calibration tightened auto-approval confidence bar");
        }

        Some(CalibrationChange {
            before,
            after,
            accuracy,
            samples: stats.auto_approved,
        })
    }
}
