//! Kill-report stream listener.
//!
//! The upstream killer publishes kill reports to a durable stream; medic
//! reads them through a named consumer group so un-acked messages are
//! redelivered after a crash. Two implementations share one capability set:
//! the Redis Streams listener used in production and a mock that yields
//! synthetic events for development (`--mock`) and tests. The orchestrator
//! is parameterized over the trait and does not distinguish variants.

use crate::error::StreamError;
use crate::types::{KillReason, Severity};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::streams::{StreamClaimReply, StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reconnect backoff: base 500 ms, doubling, capped at 30 s, retried forever.
const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// How long one read blocks before yielding control.
const READ_BLOCK_MS: usize = 5000;

/// Messages pending longer than this are reclaimed at startup.
const RECLAIM_IDLE: Duration = Duration::from_secs(300);

/// Batch size when scanning the pending list at startup.
const RECLAIM_SCAN_COUNT: usize = 100;

/// One delivered stream entry: the broker id and the raw `payload` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    /// Canonical JSON of the kill report; empty when the entry had no
    /// `payload` field (treated as invalid input downstream).
    pub payload: String,
}

/// Capability the orchestrator consumes: a stream of messages plus
/// acknowledgement of fully processed ones.
#[async_trait]
pub trait KillStream: Send {
    /// Next message. `None` means the stream is exhausted (mock only; the
    /// durable listener reconnects forever).
    async fn next(&mut self) -> Option<StreamMessage>;

    /// Confirm end-to-end processing. Must only be called after the outcome
    /// record is durably stored.
    async fn ack(&mut self, message_id: &str) -> Result<(), StreamError>;
}

/// Consumer-group listener over Redis Streams.
pub struct RedisStreamListener {
    client: redis::Client,
    conn: Option<redis::aio::MultiplexedConnection>,
    stream: String,
    group: String,
    consumer: String,
    /// Messages reclaimed from a crashed predecessor, served first.
    reclaimed: VecDeque<StreamMessage>,
    backoff: Duration,
}

impl RedisStreamListener {
    pub fn connect(
        endpoint: &str,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self, StreamError> {
        let client = redis::Client::open(endpoint).map_err(|e| StreamError::Connection {
            message: e.to_string(),
        })?;
        Ok(Self {
            client,
            conn: None,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            reclaimed: VecDeque::new(),
            backoff: RECONNECT_BASE,
        })
    }

    /// Establish a connection, create the group (idempotent), and reclaim
    /// stale pending messages from this consumer's past life.
    async fn establish(&mut self) -> Result<redis::aio::MultiplexedConnection, StreamError> {
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| StreamError::Connection {
                message: e.to_string(),
            })?;

        let created: redis::RedisResult<String> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match created {
            Ok(_) => info!(stream = %self.stream, group = %self.group, "created consumer group"),
            Err(err) if err.to_string().contains("BUSYGROUP") => {}
            Err(err) => {
                return Err(StreamError::Connection {
                    message: err.to_string(),
                });
            }
        }

        self.reclaim_stale(&mut conn).await?;
        Ok(conn)
    }

    /// Claim messages delivered to any consumer in the group that have been
    /// idle past the threshold. Recovers from mid-processing crashes.
    async fn reclaim_stale(
        &mut self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(), StreamError> {
        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.stream, &self.group, "-", "+", RECLAIM_SCAN_COUNT)
            .await
            .map_err(|e| StreamError::Read {
                message: e.to_string(),
            })?;

        let idle_ms = RECLAIM_IDLE.as_millis() as usize;
        let stale: Vec<String> = pending
            .ids
            .iter()
            .filter(|entry| entry.last_delivered_ms >= idle_ms)
            .map(|entry| entry.id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(&self.stream, &self.group, &self.consumer, idle_ms, &stale)
            .await
            .map_err(|e| StreamError::Read {
                message: e.to_string(),
            })?;

        info!(count = claimed.ids.len(), "reclaimed stale pending messages");
        for entry in claimed.ids {
            let payload: String = entry.get("payload").unwrap_or_default();
            self.reclaimed.push_back(StreamMessage {
                id: entry.id,
                payload,
            });
        }
        Ok(())
    }

    async fn backoff_sleep(&mut self) {
        warn!(delay_ms = self.backoff.as_millis() as u64, "stream unavailable; backing off");
        tokio::time::sleep(self.backoff).await;
        self.backoff = (self.backoff * 2).min(RECONNECT_CAP);
    }
}

#[async_trait]
impl KillStream for RedisStreamListener {
    async fn next(&mut self) -> Option<StreamMessage> {
        loop {
            if let Some(message) = self.reclaimed.pop_front() {
                return Some(message);
            }

            if self.conn.is_none() {
                match self.establish().await {
                    Ok(conn) => {
                        self.conn = Some(conn);
                        self.backoff = RECONNECT_BASE;
                    }
                    Err(err) => {
                        debug!(error = %err, "stream connect failed");
                        self.backoff_sleep().await;
                        continue;
                    }
                }
            }
            let conn = self.conn.as_mut().expect("connection established");

            let options = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(1)
                .block(READ_BLOCK_MS);
            let reply: redis::RedisResult<StreamReadReply> =
                conn.xread_options(&[&self.stream], &[">"], &options).await;

            match reply {
                Ok(reply) => {
                    for key in reply.keys {
                        for entry in key.ids {
                            let payload: String = entry.get("payload").unwrap_or_default();
                            return Some(StreamMessage {
                                id: entry.id,
                                payload,
                            });
                        }
                    }
                    // Block expired with nothing to do; read again.
                }
                Err(err) => {
                    warn!(error = %err, "stream read failed; reconnecting");
                    self.conn = None;
                    self.backoff_sleep().await;
                }
            }
        }
    }

    async fn ack(&mut self, message_id: &str) -> Result<(), StreamError> {
        let conn = self.conn.as_mut().ok_or_else(|| StreamError::Ack {
            message_id: message_id.to_string(),
            message: "not connected".to_string(),
        })?;
        let _acked: i64 = conn
            .xack(&self.stream, &self.group, &[message_id])
            .await
            .map_err(|e| StreamError::Ack {
                message_id: message_id.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

/// Mock listener for development and tests.
///
/// With an explicit message script it drains the script and then ends the
/// stream; in rotating mode it synthesizes a deterministic scenario cycle
/// (low-risk, high-risk, invalid) forever.
pub struct MockListener {
    queue: VecDeque<StreamMessage>,
    rotate_every: Option<Duration>,
    sequence: u64,
    acked: Arc<Mutex<Vec<String>>>,
}

impl MockListener {
    /// Finite script of `(id, payload)` messages; the stream ends after the
    /// last one.
    pub fn with_messages(messages: Vec<(String, String)>) -> Self {
        Self {
            queue: messages
                .into_iter()
                .map(|(id, payload)| StreamMessage { id, payload })
                .collect(),
            rotate_every: None,
            sequence: 0,
            acked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Endless synthetic events, one per `interval`.
    pub fn rotating(interval: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            rotate_every: Some(interval),
            sequence: 0,
            acked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle to the ids acked so far (test observation point).
    pub fn acks(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.acked)
    }

    fn synthesize(&mut self) -> StreamMessage {
        let n = self.sequence;
        self.sequence += 1;

        // Every fourth event is malformed to exercise the invalid-input path.
        let (module, reason, severity, confidence) = match n % 4 {
            0 => ("nginx-test", KillReason::AnomalyBehavior, Severity::Low, 0.4),
            1 => ("billing", KillReason::ThreatDetected, Severity::Critical, 0.97),
            2 => ("cache", KillReason::ResourceExhaustion, Severity::Medium, 0.6),
            _ => ("bad/module", KillReason::PolicyViolation, Severity::Info, 0.1),
        };

        let payload = serde_json::json!({
            "kill_id": format!("mock-{n}"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "target_module": module,
            "target_instance_id": format!("{}-{n}", module.replace('/', "-")),
            "kill_reason": reason,
            "severity": severity,
            "confidence_score": confidence,
            "evidence": ["synthetic"],
            "dependencies": [],
            "source_agent": "mock-killer",
            "metadata": {"synthetic": true}
        });

        StreamMessage {
            id: format!("mock-{n}"),
            payload: payload.to_string(),
        }
    }
}

#[async_trait]
impl KillStream for MockListener {
    async fn next(&mut self) -> Option<StreamMessage> {
        if let Some(message) = self.queue.pop_front() {
            return Some(message);
        }
        match self.rotate_every {
            Some(interval) => {
                tokio::time::sleep(interval).await;
                Some(self.synthesize())
            }
            None => None,
        }
    }

    async fn ack(&mut self, message_id: &str) -> Result<(), StreamError> {
        self.acked.lock().unwrap().push(message_id.to_string());
        Ok(())
    }
}
