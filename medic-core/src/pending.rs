//! In-memory queue of decisions awaiting human review.
//!
//! Keyed by `kill_id` and guarded by a single mutex; mutated by the
//! orchestrator (insert, expire) and by the HTTP approve handler (claim,
//! remove). Deliberately not durable: entries that survived a crash would
//! race with stream redelivery, so redelivery reconstructs pending state
//! instead.

use crate::types::{Decision, KillReport};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Hard cap on queued reviews; beyond it new PendingReview decisions
/// downgrade to Deny with a backpressure warning.
pub const PENDING_CAP: usize = 1000;

/// One queued review.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub report: KillReport,
    pub decision: Decision,
    pub expires_at: DateTime<Utc>,
    /// Set while an approval is executing, so a second approval gets 409
    /// instead of a double restart.
    in_flight: bool,
}

/// Outcome of trying to queue a review.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueResult {
    Queued,
    /// The queue is at capacity; the caller downgrades to Deny.
    Saturated,
    /// An entry for this kill id already exists.
    Duplicate,
}

/// Outcome of trying to claim an entry for approval.
#[derive(Debug)]
pub enum ClaimResult {
    Claimed(Box<PendingEntry>),
    NotPending,
    AlreadyInFlight,
}

#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a decision for review. Capacity counts live entries only.
    pub fn insert(&self, report: KillReport, decision: Decision) -> EnqueueResult {
        let mut entries = self.entries.lock().expect("pending queue lock");
        if entries.contains_key(&decision.kill_id) {
            return EnqueueResult::Duplicate;
        }
        if entries.len() >= PENDING_CAP {
            return EnqueueResult::Saturated;
        }
        let expires_at =
            Utc::now() + ChronoDuration::minutes(i64::from(decision.timeout_minutes));
        entries.insert(
            decision.kill_id.clone(),
            PendingEntry {
                report,
                decision,
                expires_at,
                in_flight: false,
            },
        );
        EnqueueResult::Queued
    }

    /// Claim an entry for approval, marking it in-flight. The caller must
    /// follow up with [`PendingQueue::remove`] once the outcome is recorded.
    pub fn claim(&self, kill_id: &str) -> ClaimResult {
        let mut entries = self.entries.lock().expect("pending queue lock");
        match entries.get_mut(kill_id) {
            None => ClaimResult::NotPending,
            Some(entry) if entry.in_flight => ClaimResult::AlreadyInFlight,
            Some(entry) => {
                entry.in_flight = true;
                ClaimResult::Claimed(Box::new(entry.clone()))
            }
        }
    }

    /// Clear the in-flight mark without removing the entry, so a failed
    /// approval can be retried.
    pub fn release(&self, kill_id: &str) {
        if let Some(entry) = self
            .entries
            .lock()
            .expect("pending queue lock")
            .get_mut(kill_id)
        {
            entry.in_flight = false;
        }
    }

    /// Drop an entry (after approval completed, successfully or not).
    pub fn remove(&self, kill_id: &str) {
        self.entries
            .lock()
            .expect("pending queue lock")
            .remove(kill_id);
    }

    /// Remove and return all entries past their deadline. In-flight entries
    /// are skipped; their approval path owns them now.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Vec<PendingEntry> {
        let mut entries = self.entries.lock().expect("pending queue lock");
        let due: Vec<String> = entries
            .iter()
            .filter(|(_, e)| !e.in_flight && e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        due.into_iter()
            .filter_map(|k| entries.remove(&k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pending queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DecisionOutcome, KillReason, RiskLevel, Severity};
    use uuid::Uuid;

    fn report(kill_id: &str) -> KillReport {
        KillReport {
            kill_id: kill_id.to_string(),
            timestamp: Utc::now(),
            target_module: "api".to_string(),
            target_instance_id: "api-1".to_string(),
            kill_reason: KillReason::AnomalyBehavior,
            severity: Severity::Medium,
            confidence_score: 0.5,
            evidence: vec![],
            dependencies: vec![],
            source_agent: "killer-1".to_string(),
            metadata: serde_json::Map::new(),
        }
    }

    fn decision(kill_id: &str, timeout_minutes: u32) -> Decision {
        Decision {
            decision_id: Uuid::new_v4(),
            kill_id: kill_id.to_string(),
            outcome: DecisionOutcome::PendingReview,
            risk_level: RiskLevel::Medium,
            risk_score: 0.5,
            confidence: 0.9,
            reasoning: vec![],
            requires_human_review: true,
            timeout_minutes,
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_claim_remove_cycle() {
        let queue = PendingQueue::new();
        assert_eq!(
            queue.insert(report("k1"), decision("k1", 30)),
            EnqueueResult::Queued
        );
        assert_eq!(queue.len(), 1);

        match queue.claim("k1") {
            ClaimResult::Claimed(entry) => assert_eq!(entry.decision.kill_id, "k1"),
            other => panic!("expected claim, got {other:?}"),
        }
        // Second claim while in flight.
        assert!(matches!(queue.claim("k1"), ClaimResult::AlreadyInFlight));

        queue.remove("k1");
        assert!(matches!(queue.claim("k1"), ClaimResult::NotPending));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let queue = PendingQueue::new();
        queue.insert(report("k1"), decision("k1", 30));
        assert_eq!(
            queue.insert(report("k1"), decision("k1", 30)),
            EnqueueResult::Duplicate
        );
    }

    #[test]
    fn test_capacity_saturation() {
        let queue = PendingQueue::new();
        for i in 0..PENDING_CAP {
            let id = format!("k{i}");
            assert_eq!(
                queue.insert(report(&id), decision(&id, 30)),
                EnqueueResult::Queued
            );
        }
        assert_eq!(
            queue.insert(report("overflow"), decision("overflow", 30)),
            EnqueueResult::Saturated
        );
        assert_eq!(queue.len(), PENDING_CAP);
    }

    #[test]
    fn test_expiry_skips_in_flight() {
        let queue = PendingQueue::new();
        queue.insert(report("k1"), decision("k1", 0));
        queue.insert(report("k2"), decision("k2", 0));
        queue.insert(report("k3"), decision("k3", 60));
        let _ = queue.claim("k2");

        let expired = queue.expire_due(Utc::now() + ChronoDuration::seconds(1));
        let mut ids: Vec<_> = expired.iter().map(|e| e.decision.kill_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["k1"]);
        // k2 is in flight, k3 not due.
        assert_eq!(queue.len(), 2);
    }
}
