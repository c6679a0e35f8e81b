//! Durable outcome store backed by SQLite.
//!
//! Append-only log of every decision and its result, plus the aggregation
//! queries the decision engine and HTTP surface read. All SQLite work runs
//! on the blocking pool via `tokio::task::spawn_blocking`; each operation
//! opens its own connection so readers never wait on the writer (WAL mode).
//! Transient `SQLITE_BUSY` conditions are retried with exponential backoff.
//!
//! Column names appearing in query text come only from the compile-time SQL
//! below; all values are bound parameters.

use crate::error::StoreError;
use crate::types::{OutcomeRecord, OutcomeType};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Current on-disk schema version, kept in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// Busy retry policy: base 50 ms, doubling, at most 5 attempts.
const BUSY_RETRY_BASE_MS: u64 = 50;
const BUSY_RETRY_ATTEMPTS: u32 = 5;

const CREATE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS outcomes (
    outcome_id              TEXT PRIMARY KEY,
    decision_id             TEXT NOT NULL,
    kill_id                 TEXT NOT NULL,
    target_module           TEXT NOT NULL,
    outcome_type            TEXT NOT NULL,
    was_auto_approved       INTEGER NOT NULL,
    original_risk_score     REAL NOT NULL,
    original_confidence     REAL NOT NULL,
    time_to_healthy_seconds REAL,
    health_score_after      REAL,
    recorded_at             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outcomes_recorded_at ON outcomes (recorded_at);
CREATE INDEX IF NOT EXISTS idx_outcomes_target_module ON outcomes (target_module);
CREATE INDEX IF NOT EXISTS idx_outcomes_outcome_type ON outcomes (outcome_type);
CREATE INDEX IF NOT EXISTS idx_outcomes_auto_approved ON outcomes (was_auto_approved);
";

/// Aggregates over a rolling window, as served by `/stats` and consumed by
/// calibration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OutcomeStatistics {
    pub window_days: u32,
    pub total: u64,
    /// Count per outcome type (stable snake_case keys).
    pub counts: BTreeMap<String, u64>,
    /// Successes (full or partial) over all records in the window.
    pub success_rate: f64,
    pub auto_approved: u64,
    pub auto_approved_successes: u64,
    /// `auto_approved_successes / auto_approved`; zero when nothing was
    /// auto-approved in the window.
    pub auto_approve_accuracy: f64,
}

/// Handle to the outcome store. Cheap to clone; every operation opens its
/// own connection.
#[derive(Debug, Clone)]
pub struct OutcomeStore {
    path: PathBuf,
}

impl OutcomeStore {
    /// Open (or create) the store at `path`, creating parent directories,
    /// the schema, and its indexes. Rejects databases with a mismatched
    /// schema version.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let store = Self { path: path.clone() };
        store
            .run(move |conn| {
                let version: i64 = conn
                    .query_row("PRAGMA user_version", [], |row| row.get(0))
                    .map_err(query_err)?;
                if version != 0 && version != SCHEMA_VERSION {
                    return Err(StoreError::SchemaMismatch {
                        found: version,
                        expected: SCHEMA_VERSION,
                    });
                }
                conn.execute_batch(CREATE_SCHEMA).map_err(query_err)?;
                if version == 0 {
                    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
                        .map_err(query_err)?;
                }
                Ok(())
            })
            .await?;
        Ok(store)
    }

    /// Append a record. Durable once this returns; the orchestrator only
    /// acks the stream message afterwards.
    pub async fn put(&self, record: OutcomeRecord) -> Result<(), StoreError> {
        self.run(move |conn| {
            with_busy_retry(|| {
                conn.execute(
                    "INSERT INTO outcomes (
                        outcome_id, decision_id, kill_id, target_module, outcome_type,
                        was_auto_approved, original_risk_score, original_confidence,
                        time_to_healthy_seconds, health_score_after, recorded_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        record.outcome_id.to_string(),
                        record.decision_id.to_string(),
                        record.kill_id,
                        record.target_module,
                        record.outcome_type.as_str(),
                        record.was_auto_approved,
                        record.original_risk_score,
                        record.original_confidence,
                        record.time_to_healthy_seconds,
                        record.health_score_after,
                        encode_ts(&record.recorded_at),
                    ],
                )
                .map(|_| ())
            })
        })
        .await
    }

    /// Most recent `limit` records, newest first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<OutcomeRecord>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT outcome_id, decision_id, kill_id, target_module, outcome_type,
                            was_auto_approved, original_risk_score, original_confidence,
                            time_to_healthy_seconds, health_score_after, recorded_at
                     FROM outcomes ORDER BY recorded_at DESC, outcome_id DESC LIMIT ?1",
                )
                .map_err(query_err)?;
            let rows = stmt
                .query_map(params![limit], row_to_record)
                .map_err(query_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(query_err)
        })
        .await
    }

    /// Count of ReKilled / Failure outcomes for a module within the rolling
    /// window. Feeds the false-positive-history risk factor.
    pub async fn module_history(
        &self,
        target_module: &str,
        window_days: u32,
    ) -> Result<u64, StoreError> {
        let module = target_module.to_string();
        let cutoff = encode_ts(&(Utc::now() - ChronoDuration::days(i64::from(window_days))));
        self.run(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM outcomes
                 WHERE target_module = ?1
                   AND outcome_type IN ('re_killed', 'failure')
                   AND recorded_at >= ?2",
                params![module, cutoff],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as u64)
            .map_err(query_err)
        })
        .await
    }

    /// Aggregate counts and auto-approve accuracy over the window.
    pub async fn statistics(&self, window_days: u32) -> Result<OutcomeStatistics, StoreError> {
        let cutoff = encode_ts(&(Utc::now() - ChronoDuration::days(i64::from(window_days))));
        self.run(move |conn| {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            let mut stmt = conn
                .prepare(
                    "SELECT outcome_type, COUNT(*) FROM outcomes
                     WHERE recorded_at >= ?1 GROUP BY outcome_type",
                )
                .map_err(query_err)?;
            let rows = stmt
                .query_map(params![cutoff], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(query_err)?;
            for row in rows {
                let (kind, n) = row.map_err(query_err)?;
                counts.insert(kind, n.max(0) as u64);
            }

            let (auto_approved, auto_successes): (i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN outcome_type = 'success' THEN 1 ELSE 0 END), 0)
                     FROM outcomes
                     WHERE recorded_at >= ?1 AND was_auto_approved = 1",
                    params![cutoff],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(query_err)?;

            let total: u64 = counts.values().sum();
            let successes = counts.get("success").copied().unwrap_or(0)
                + counts.get("partial_success").copied().unwrap_or(0);
            let success_rate = if total > 0 {
                successes as f64 / total as f64
            } else {
                0.0
            };
            let auto_approved = auto_approved.max(0) as u64;
            let auto_approved_successes = auto_successes.max(0) as u64;
            let auto_approve_accuracy = if auto_approved > 0 {
                auto_approved_successes as f64 / auto_approved as f64
            } else {
                0.0
            };

            Ok(OutcomeStatistics {
                window_days,
                total,
                counts,
                success_rate,
                auto_approved,
                auto_approved_successes,
                auto_approve_accuracy,
            })
        })
        .await
    }

    /// Whether a kill id already has an outcome within the last `hours`.
    /// Used for at-least-once dedupe before processing.
    pub async fn seen_recently(&self, kill_id: &str, hours: u32) -> Result<bool, StoreError> {
        let kill_id = kill_id.to_string();
        let cutoff = encode_ts(&(Utc::now() - ChronoDuration::hours(i64::from(hours))));
        self.run(move |conn| {
            conn.query_row(
                "SELECT 1 FROM outcomes WHERE kill_id = ?1 AND recorded_at >= ?2 LIMIT 1",
                params![kill_id, cutoff],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(query_err)
        })
        .await
    }

    /// Whether a module was successfully resurrected within the last
    /// `minutes`. A fresh kill inside this window marks a re-kill.
    pub async fn resurrected_recently(
        &self,
        target_module: &str,
        minutes: u32,
    ) -> Result<bool, StoreError> {
        let module = target_module.to_string();
        let cutoff = encode_ts(&(Utc::now() - ChronoDuration::minutes(i64::from(minutes))));
        self.run(move |conn| {
            conn.query_row(
                "SELECT 1 FROM outcomes
                 WHERE target_module = ?1
                   AND outcome_type IN ('success', 'partial_success')
                   AND recorded_at >= ?2
                 LIMIT 1",
                params![module, cutoff],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(query_err)
        })
        .await
    }

    /// Run a blocking closure against a fresh connection on the blocking
    /// pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Join {
            message: e.to_string(),
        })?
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        }
    }
    let conn = Connection::open(path).map_err(|e| StoreError::Open {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    // WAL lets HTTP readers proceed while the orchestrator writes.
    let _: String = conn
        .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
        .map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    conn.busy_timeout(Duration::from_millis(BUSY_RETRY_BASE_MS))
        .map_err(query_err)?;
    Ok(conn)
}

/// Retry a statement on `SQLITE_BUSY` / `SQLITE_LOCKED` with exponential
/// backoff: 50 ms base, doubling, at most 5 attempts.
fn with_busy_retry<T>(
    mut op: impl FnMut() -> Result<T, rusqlite::Error>,
) -> Result<T, StoreError> {
    let mut delay = Duration::from_millis(BUSY_RETRY_BASE_MS);
    for attempt in 1..=BUSY_RETRY_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) && attempt < BUSY_RETRY_ATTEMPTS => {
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(err) if is_busy(&err) => {
                return Err(StoreError::Busy {
                    attempts: BUSY_RETRY_ATTEMPTS,
                });
            }
            Err(err) => return Err(query_err(err)),
        }
    }
    unreachable!("retry loop always returns")
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn query_err(err: rusqlite::Error) -> StoreError {
    StoreError::Query {
        message: err.to_string(),
    }
}

/// RFC 3339 with microseconds and a `Z` suffix: a fixed-width encoding, so
/// lexicographic comparison in SQL matches chronological order.
fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                10,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<OutcomeRecord, rusqlite::Error> {
    let outcome_id: String = row.get(0)?;
    let decision_id: String = row.get(1)?;
    let outcome_type: String = row.get(4)?;
    let recorded_at: String = row.get(10)?;
    Ok(OutcomeRecord {
        outcome_id: Uuid::parse_str(&outcome_id).unwrap_or_else(|_| Uuid::nil()),
        decision_id: Uuid::parse_str(&decision_id).unwrap_or_else(|_| Uuid::nil()),
        kill_id: row.get(2)?,
        target_module: row.get(3)?,
        outcome_type: OutcomeType::parse(&outcome_type).unwrap_or(OutcomeType::Undetermined),
        was_auto_approved: row.get(5)?,
        original_risk_score: row.get(6)?,
        original_confidence: row.get(7)?,
        time_to_healthy_seconds: row.get(8)?,
        health_score_after: row.get(9)?,
        recorded_at: decode_ts(&recorded_at)?,
    })
}
