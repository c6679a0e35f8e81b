//! The single-writer pipeline coordinator.
//!
//! One event at a time: dedupe -> enrich -> decide -> act -> record -> ack.
//! Acknowledgement strictly follows durable outcome persistence; a failure
//! anywhere leaves the message un-acked so the stream redelivers it. The
//! pending-expiry ticker and the calibration ticker run on the same loop, so
//! the engine never sees concurrent access.

use crate::engine::DecisionEngine;
use crate::error::{MedicError, StoreError};
use crate::pending::{ClaimResult, EnqueueResult, PendingQueue};
use crate::resurrector::Resurrect;
use crate::siem::SiemClient;
use crate::store::OutcomeStore;
use crate::stream::{KillStream, StreamMessage};
use crate::types::{
    Decision, DecisionOutcome, KillReport, OperatingMode, OutcomeRecord, OutcomeType, RiskLevel,
};
use crate::validation::validate_kill_report;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A kill id already recorded within this window is acked without
/// re-processing (at-least-once dedupe).
const DEDUPE_HOURS: u32 = 24;

/// Pending-expiry sweep cadence.
const EXPIRY_TICK: Duration = Duration::from_secs(1);

/// Counters surfaced on `/health`.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub processed: AtomicU64,
    pub auto_approved: AtomicU64,
}

/// Shared approval executor: the HTTP approve endpoint and nothing else
/// goes through here. Claims the pending entry, resurrects, records, and
/// releases the queue slot.
pub struct ApprovalService {
    store: OutcomeStore,
    resurrector: Arc<dyn Resurrect>,
    pending: Arc<PendingQueue>,
}

/// Why an approval did not run.
#[derive(Debug)]
pub enum ApprovalError {
    NotPending,
    AlreadyInFlight,
    Store(StoreError),
}

/// What an executed approval produced, for the HTTP response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApprovalOutcome {
    pub kill_id: String,
    pub target_module: String,
    pub outcome_type: OutcomeType,
    pub time_to_healthy_seconds: Option<f64>,
    pub health_score_after: Option<f64>,
}

impl ApprovalService {
    pub fn new(
        store: OutcomeStore,
        resurrector: Arc<dyn Resurrect>,
        pending: Arc<PendingQueue>,
    ) -> Self {
        Self {
            store,
            resurrector,
            pending,
        }
    }

    /// Execute a manual approval for a pending kill.
    pub async fn approve(&self, kill_id: &str) -> Result<ApprovalOutcome, ApprovalError> {
        let entry = match self.pending.claim(kill_id) {
            ClaimResult::Claimed(entry) => entry,
            ClaimResult::NotPending => return Err(ApprovalError::NotPending),
            ClaimResult::AlreadyInFlight => return Err(ApprovalError::AlreadyInFlight),
        };

        info!(kill_id, target_module = %entry.report.target_module, "manual approval: resurrecting");
        let restart = self.resurrector.restart(&entry.report.target_module).await;
        let record = OutcomeRecord::for_decision(
            &entry.decision,
            &entry.report.target_module,
            restart.outcome_type(),
            restart.time_to_healthy_seconds,
            restart.health_score_after,
            false,
        );

        if let Err(err) = self.store.put(record).await {
            // Leave the entry claimable so the operator can retry.
            self.pending.release(kill_id);
            return Err(ApprovalError::Store(err));
        }
        self.pending.remove(kill_id);

        Ok(ApprovalOutcome {
            kill_id: kill_id.to_string(),
            target_module: entry.report.target_module.clone(),
            outcome_type: restart.outcome_type(),
            time_to_healthy_seconds: restart.time_to_healthy_seconds,
            health_score_after: restart.health_score_after,
        })
    }
}

/// The pipeline loop.
pub struct Orchestrator {
    listener: Box<dyn KillStream>,
    siem: Arc<dyn SiemClient>,
    engine: DecisionEngine,
    store: OutcomeStore,
    resurrector: Arc<dyn Resurrect>,
    pending: Arc<PendingQueue>,
    counters: Arc<PipelineCounters>,
    calibration_window_days: u32,
    calibration_interval: Duration,
    rekill_window_minutes: u32,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: Box<dyn KillStream>,
        siem: Arc<dyn SiemClient>,
        engine: DecisionEngine,
        store: OutcomeStore,
        resurrector: Arc<dyn Resurrect>,
        pending: Arc<PendingQueue>,
        counters: Arc<PipelineCounters>,
        calibration_window_days: u32,
        calibration_interval: Duration,
        rekill_window_minutes: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            siem,
            engine,
            store,
            resurrector,
            pending,
            counters,
            calibration_window_days,
            calibration_interval,
            rekill_window_minutes,
            shutdown,
        }
    }

    /// Run until the stream ends (mock), shutdown is signalled, or the
    /// outcome store fails fatally.
    pub async fn run(mut self) -> Result<(), MedicError> {
        self.calibrate().await;

        let mut expiry = tokio::time::interval(EXPIRY_TICK);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut calibration = tokio::time::interval(self.calibration_interval);
        calibration.set_missed_tick_behavior(MissedTickBehavior::Skip);
        calibration.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("shutdown requested; orchestrator stopping");
                    break;
                }
                message = self.listener.next() => match message {
                    Some(message) => {
                        if let Err(err) = self.process(&message).await {
                            // Do not ack; redelivery will retry.
                            error!(message_id = %message.id, error = %err, "pipeline step failed");
                            if let MedicError::Store(store_err) = &err {
                                if store_err.is_fatal() {
                                    return Err(err);
                                }
                            }
                        }
                    }
                    None => {
                        info!("stream ended; orchestrator stopping");
                        break;
                    }
                },
                _ = expiry.tick() => {
                    if let Err(err) = self.expire_pending().await {
                        error!(error = %err, "pending expiry sweep failed");
                        if let MedicError::Store(store_err) = &err {
                            if store_err.is_fatal() {
                                return Err(err);
                            }
                        }
                    }
                }
                _ = calibration.tick() => self.calibrate().await,
            }
        }
        Ok(())
    }

    /// Handle one delivered message end to end.
    async fn process(&mut self, message: &StreamMessage) -> Result<(), MedicError> {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let report = match serde_json::from_str::<KillReport>(&message.payload) {
            Ok(report) => report,
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "unparseable kill report");
                return self.record_invalid(message, None).await;
            }
        };
        if let Err(failure) = validate_kill_report(&report) {
            warn!(kill_id = %report.kill_id, %failure, "kill report failed validation");
            return self.record_invalid(message, Some(&report)).await;
        }

        if self.store.seen_recently(&report.kill_id, DEDUPE_HOURS).await? {
            info!(kill_id = %report.kill_id, "duplicate within dedupe window; acking without re-processing");
            self.listener.ack(&message.id).await?;
            return Ok(());
        }

        // Noted before this kill writes its own record: a fresh kill right
        // after a successful resurrection means our patient was re-killed.
        let rekilled = self
            .store
            .resurrected_recently(&report.target_module, self.rekill_window_minutes)
            .await?;

        let siem = self.siem.enrich(&report).await;
        let history = self
            .store
            .module_history(&report.target_module, self.calibration_window_days)
            .await?;
        let mut decision = self.engine.decide(&report, &siem, history);

        let mode = self.engine.mode();
        let mut outcome_type = OutcomeType::Undetermined;
        let mut time_to_healthy = None;
        let mut health_score = None;
        let mut acted_auto = false;

        match decision.outcome {
            DecisionOutcome::ApproveAuto if mode == OperatingMode::Live => {
                acted_auto = true;
                self.counters.auto_approved.fetch_add(1, Ordering::Relaxed);
                let restart = self.resurrector.restart(&report.target_module).await;
                outcome_type = restart.outcome_type();
                time_to_healthy = restart.time_to_healthy_seconds;
                health_score = restart.health_score_after;
            }
            DecisionOutcome::ApproveAuto => {
                // Observer mode: classified, never acted on.
            }
            DecisionOutcome::PendingReview if mode == OperatingMode::Observer => {
                // Observer mode classifies only; queueing would let the
                // approval endpoint act.
            }
            DecisionOutcome::PendingReview => {
                match self.pending.insert(report.clone(), decision.clone()) {
                    EnqueueResult::Queued => {}
                    EnqueueResult::Saturated => {
                        warn!(
                            kill_id = %report.kill_id,
                            queued = self.pending.len(),
                            "pending queue saturated; downgrading to deny (backpressure)"
                        );
                        decision.outcome = DecisionOutcome::Deny;
                        decision
                            .reasoning
                            .push("pending queue saturated; denied under backpressure".to_string());
                    }
                    EnqueueResult::Duplicate => {
                        warn!(kill_id = %report.kill_id, "kill already pending review");
                    }
                }
            }
            DecisionOutcome::Deny | DecisionOutcome::ApproveManual | DecisionOutcome::Defer => {}
        }

        if outcome_type == OutcomeType::Undetermined && rekilled {
            outcome_type = OutcomeType::ReKilled;
        }

        info!(
            kill_id = %report.kill_id,
            target_module = %report.target_module,
            decision = %decision.outcome,
            risk_score = decision.risk_score,
            confidence = decision.confidence,
            outcome = %outcome_type,
            "kill report processed"
        );

        let record = OutcomeRecord::for_decision(
            &decision,
            &report.target_module,
            outcome_type,
            time_to_healthy,
            health_score,
            acted_auto,
        );
        self.store.put(record).await?;
        self.listener.ack(&message.id).await?;
        Ok(())
    }

    /// Record an invalid inbound record as Undetermined and ack it; bad
    /// input never blocks the pipeline.
    async fn record_invalid(
        &mut self,
        message: &StreamMessage,
        report: Option<&KillReport>,
    ) -> Result<(), MedicError> {
        let decision = Decision {
            decision_id: Uuid::new_v4(),
            kill_id: report
                .map(|r| r.kill_id.clone())
                .unwrap_or_else(|| format!("stream:{}", message.id)),
            outcome: DecisionOutcome::Deny,
            risk_level: RiskLevel::Minimal,
            risk_score: 0.0,
            confidence: 0.0,
            reasoning: vec!["invalid_input".to_string()],
            requires_human_review: false,
            timeout_minutes: 0,
            decided_at: Utc::now(),
        };
        let module = report.map(|r| r.target_module.as_str()).unwrap_or("unknown");
        let record = OutcomeRecord::for_decision(
            &decision,
            module,
            OutcomeType::Undetermined,
            None,
            None,
            false,
        );
        self.store.put(record).await?;
        self.listener.ack(&message.id).await?;
        Ok(())
    }

    /// Expire pending entries past their deadline, recording Undetermined.
    async fn expire_pending(&mut self) -> Result<(), MedicError> {
        for entry in self.pending.expire_due(Utc::now()) {
            warn!(
                kill_id = %entry.decision.kill_id,
                "pending review expired without approval"
            );
            let record = OutcomeRecord::for_decision(
                &entry.decision,
                &entry.report.target_module,
                OutcomeType::Undetermined,
                None,
                None,
                false,
            );
            self.store.put(record).await?;
        }
        Ok(())
    }

    /// Read window statistics and let the engine adjust its confidence bar.
    async fn calibrate(&mut self) {
        match self.store.statistics(self.calibration_window_days).await {
            Ok(stats) => {
                self.engine.calibrate(&stats);
            }
            Err(err) => warn!(error = %err, "calibration skipped: statistics unavailable"),
        }
    }
}
