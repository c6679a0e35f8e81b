//! SIEM enrichment client.
//!
//! A thin request/response adapter: one HTTP query per kill report, with a
//! hard deadline. Enrichment is an enhancement, never a prerequisite — every
//! failure path degrades to the no-op sentinel with a structured warning, so
//! an unreachable SIEM cannot stall the pipeline.
//!
//! Credentials are read from the environment only (`SIEM_TOKEN`, or
//! `SIEM_USERNAME` / `SIEM_PASSWORD` for basic auth) and are never logged or
//! serialized.

use crate::config::SiemConfig;
use crate::types::{KillReport, SiemResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum length of the free-text recommendation we keep.
const MAX_RECOMMENDATION_BYTES: usize = 1024;

/// Hours of SIEM history requested per query.
const QUERY_WINDOW_HOURS: u32 = 24;

/// Enriches kill reports with SIEM context. Infallible by contract: every
/// implementation returns a usable [`SiemResult`].
#[async_trait]
pub trait SiemClient: Send + Sync {
    async fn enrich(&self, report: &KillReport) -> SiemResult;
}

/// No-op client used when enrichment is disabled or misconfigured.
pub struct NoopSiemClient;

#[async_trait]
impl SiemClient for NoopSiemClient {
    async fn enrich(&self, _report: &KillReport) -> SiemResult {
        SiemResult::noop()
    }
}

enum SiemAuth {
    Bearer(String),
    Basic { username: String, password: String },
}

/// Real client: `POST {base_url}/query` with a bearer or basic credential.
pub struct HttpSiemClient {
    client: reqwest::Client,
    base_url: String,
    auth: SiemAuth,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SiemQueryResponse {
    risk_score: f64,
    false_positive_history: u32,
    #[serde(default)]
    recommendation: String,
}

impl HttpSiemClient {
    /// Build a client from configuration and environment credentials.
    ///
    /// Returns `None` (caller should fall back to [`NoopSiemClient`]) when no
    /// credential is present in the environment.
    pub fn from_env(config: &SiemConfig) -> Option<Self> {
        let auth = match std::env::var("SIEM_TOKEN") {
            Ok(token) if !token.is_empty() => SiemAuth::Bearer(token),
            _ => match (std::env::var("SIEM_USERNAME"), std::env::var("SIEM_PASSWORD")) {
                (Ok(username), Ok(password)) if !username.is_empty() => {
                    SiemAuth::Basic { username, password }
                }
                _ => {
                    warn!("siem.enabled is true but no SIEM_TOKEN or SIEM_USERNAME/SIEM_PASSWORD in environment; enrichment disabled");
                    return None;
                }
            },
        };

        let timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .ok()?;

        Some(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth,
            timeout,
        })
    }

    async fn query(&self, report: &KillReport) -> Result<reqwest::Response, reqwest::Error> {
        let body = serde_json::json!({
            "kill_id": report.kill_id,
            "target_module": report.target_module,
            "window_hours": QUERY_WINDOW_HOURS,
        });
        let request = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&body);
        let request = match &self.auth {
            SiemAuth::Bearer(token) => request.bearer_auth(token),
            SiemAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        };
        request.send().await
    }

    async fn parse(&self, response: reqwest::Response, kill_id: &str) -> Option<SiemResult> {
        match response.json::<SiemQueryResponse>().await {
            Ok(parsed) => {
                if !(0.0..=1.0).contains(&parsed.risk_score) || parsed.risk_score.is_nan() {
                    warn!(kill_id, risk_score = parsed.risk_score, "SIEM returned out-of-range risk score; using sentinel");
                    return None;
                }
                let mut recommendation = parsed.recommendation;
                if recommendation.len() > MAX_RECOMMENDATION_BYTES {
                    recommendation = truncate_utf8(&recommendation, MAX_RECOMMENDATION_BYTES);
                }
                Some(SiemResult {
                    risk_score: parsed.risk_score,
                    false_positive_history: parsed.false_positive_history,
                    recommendation,
                })
            }
            Err(err) => {
                warn!(kill_id, error = %err, "SIEM response was not parseable; using sentinel");
                None
            }
        }
    }

    /// How long to wait before the single 429 retry.
    fn retry_after_delay(response: &reqwest::Response) -> Duration {
        let header = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        match header {
            Some(secs) => Duration::from_secs(secs).min(Duration::from_secs(2)),
            None => Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl SiemClient for HttpSiemClient {
    async fn enrich(&self, report: &KillReport) -> SiemResult {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut retried = false;

        loop {
            let response = match self.query(report).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(kill_id = %report.kill_id, error = %err, "SIEM query failed; using sentinel");
                    return SiemResult::noop();
                }
            };

            match response.status() {
                status if status.is_success() => {
                    return match self.parse(response, &report.kill_id).await {
                        Some(result) => {
                            debug!(kill_id = %report.kill_id, risk_score = result.risk_score, "SIEM enrichment applied");
                            result
                        }
                        None => SiemResult::noop(),
                    };
                }
                StatusCode::TOO_MANY_REQUESTS if !retried => {
                    let delay = Self::retry_after_delay(&response);
                    if tokio::time::Instant::now() + delay >= deadline {
                        warn!(kill_id = %report.kill_id, "SIEM rate limited past deadline; using sentinel");
                        return SiemResult::noop();
                    }
                    retried = true;
                    tokio::time::sleep(delay).await;
                }
                status => {
                    warn!(kill_id = %report.kill_id, %status, "SIEM returned error status; using sentinel");
                    return SiemResult::noop();
                }
            }
        }
    }
}

/// Cut a string to at most `max` bytes on a char boundary.
fn truncate_utf8(s: &str, max: usize) -> String {
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> KillReport {
        serde_json::from_value(serde_json::json!({
            "kill_id": "k-1",
            "timestamp": "2026-02-11T08:30:00Z",
            "target_module": "nginx-test",
            "target_instance_id": "nginx-test-1",
            "kill_reason": "anomaly_behavior",
            "severity": "low",
            "confidence_score": 0.4,
            "evidence": [],
            "dependencies": [],
            "source_agent": "killer-1"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_noop_client_returns_sentinel() {
        let client = NoopSiemClient;
        let result = client.enrich(&sample_report()).await;
        assert_eq!(result, SiemResult::noop());
    }

    #[tokio::test]
    async fn test_http_client_unreachable_endpoint_degrades() {
        // Nothing listens here; the client must degrade to the sentinel
        // instead of surfacing an error.
        let client = HttpSiemClient {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(200))
                .build()
                .unwrap(),
            base_url: "http://127.0.0.1:9".to_string(),
            auth: SiemAuth::Bearer("test-token".to_string()),
            timeout: Duration::from_millis(200),
        };
        let result = client.enrich(&sample_report()).await;
        assert_eq!(result, SiemResult::noop());
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        let s = "héllo".repeat(300);
        let cut = truncate_utf8(&s, MAX_RECOMMENDATION_BYTES);
        assert!(cut.len() <= MAX_RECOMMENDATION_BYTES);
        assert!(s.starts_with(&cut));
    }

    #[test]
    fn test_response_parse_range_check() {
        let parsed: SiemQueryResponse = serde_json::from_str(
            r#"{"risk_score": 0.7, "false_positive_history": 3, "recommendation": "likely fp"}"#,
        )
        .unwrap();
        assert_eq!(parsed.false_positive_history, 3);
        assert_eq!(parsed.recommendation, "likely fp");
    }
}
