//! Persistence contracts and the SQLite implementation.
//!
//! RULE: Only the store talks to the database.
//! Components call store traits; they never execute SQL directly.
//!
//! RULE: Store calls are synchronous and bounded.
//! Async components reach the store through `bounded`, which runs the
//! call on the blocking pool under a timeout.

mod monitoring;
mod rules;
mod sanctions;

use crate::{
    error::{ComplianceError, ComplianceResult},
    monitoring::{
        AlertFilter, AlertStatus, ComplianceReport, MonitoringAlert, MonitoringLogEntry,
        MonitoringRule, Transaction, UserRiskProfile,
    },
    rules::ComplianceRule,
    screening::{SanctionEntry, SanctionsList, ScreeningLogEntry},
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

// ── Contracts ────────────────────────────────────────────────────────────────

pub trait RuleStore: Send + Sync {
    /// Every stored rule, disabled ones included. Unreadable rows are skipped.
    fn load_rules(&self) -> ComplianceResult<Vec<ComplianceRule>>;
    fn upsert_rule(&self, rule: &ComplianceRule) -> ComplianceResult<()>;
    /// Returns whether a row was deleted.
    fn delete_rule(&self, id: &str) -> ComplianceResult<bool>;
}

pub trait SanctionsStore: Send + Sync {
    /// Active lists with their entries.
    fn load_active_lists(&self) -> ComplianceResult<Vec<SanctionsList>>;
    /// Insert or replace list metadata. Entries are not touched.
    fn upsert_list(&self, list: &SanctionsList) -> ComplianceResult<()>;
    /// Id of the custom list called `name`, created if missing.
    fn ensure_custom_list(&self, name: &str, now: DateTime<Utc>) -> ComplianceResult<String>;
    fn insert_entry(&self, list_id: &str, entry: &SanctionEntry) -> ComplianceResult<()>;
    /// Removes an entry from a custom list. Returns whether one was removed.
    fn delete_entry(&self, entry_id: &str) -> ComplianceResult<bool>;
    fn append_screening_log(&self, entry: &ScreeningLogEntry) -> ComplianceResult<()>;
}

pub trait MonitoringStore: Send + Sync {
    /// Every stored rule, disabled ones included. Unreadable rows are skipped.
    fn load_monitoring_rules(&self) -> ComplianceResult<Vec<MonitoringRule>>;
    fn upsert_monitoring_rule(&self, rule: &MonitoringRule) -> ComplianceResult<()>;

    /// Insert or replace, including the status / risk score annotation.
    fn record_transaction(&self, tx: &Transaction) -> ComplianceResult<()>;
    /// The user's transactions at or after `since`, oldest first.
    fn transactions_for_user_since(&self, user_id: &str, since: DateTime<Utc>) -> ComplianceResult<Vec<Transaction>>;
    /// Latest activity strictly before `before`, ignoring `exclude_id`.
    fn last_activity_before(
        &self,
        user_id: &str,
        before: DateTime<Utc>,
        exclude_id: &str,
    ) -> ComplianceResult<Option<DateTime<Utc>>>;
    /// Transfers out of `account` with `after < timestamp <= until`.
    fn outbound_transfers(
        &self,
        account: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> ComplianceResult<Vec<Transaction>>;

    fn load_profile(&self, user_id: &str) -> ComplianceResult<Option<UserRiskProfile>>;
    fn save_profile(&self, profile: &UserRiskProfile) -> ComplianceResult<()>;

    fn insert_alert(&self, alert: &MonitoringAlert) -> ComplianceResult<()>;
    /// Newest first.
    fn alerts(&self, filter: &AlertFilter) -> ComplianceResult<Vec<MonitoringAlert>>;
    fn alert(&self, id: &str) -> ComplianceResult<Option<MonitoringAlert>>;
    /// Returns whether the alert exists.
    fn set_alert_status(
        &self,
        id: &str,
        status: AlertStatus,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> ComplianceResult<bool>;

    fn insert_report(&self, report: &ComplianceReport) -> ComplianceResult<()>;
    fn append_monitoring_log(&self, entry: &MonitoringLogEntry) -> ComplianceResult<()>;
}

/// Run a blocking store or cache call under `timeout`.
pub async fn bounded<T, F>(op: &'static str, timeout: Duration, call: F) -> ComplianceResult<T>
where
    F: FnOnce() -> ComplianceResult<T> + Send + 'static,
    T: Send + 'static,
{
    with_timeout(op, timeout, tokio::task::spawn_blocking(call)).await
}

async fn with_timeout<T, Fut>(op: &'static str, timeout: Duration, call: Fut) -> ComplianceResult<T>
where
    Fut: Future<Output = Result<ComplianceResult<T>, tokio::task::JoinError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ComplianceError::Unavailable(format!("{op}: {join}"))),
        Err(_) => {
            log::warn!("op={op} timed out after {}ms", timeout.as_millis());
            Err(ComplianceError::Timeout {
                op,
                after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }
}

// ── SQLite ───────────────────────────────────────────────────────────────────

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<String>, // None for :memory:
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &str) -> ComplianceResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (:memory: ignores it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> ComplianceResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> ComplianceResult<()> {
        self.conn()?
            .execute_batch(include_str!("../../../migrations/001_compliance.sql"))?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> ComplianceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ComplianceError::Unavailable("store connection lock poisoned".into()))
    }
}

// ── Column helpers ───────────────────────────────────────────────────────────

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> ComplianceResult<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn from_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// Unit enum as its bare serde name (`"manual_review"`, not `"\"manual_review\""`).
pub(crate) fn enum_text<T: Serialize>(value: &T) -> ComplianceResult<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(ComplianceError::Other(anyhow::anyhow!(
            "expected a string-encoded enum, got {other}"
        ))),
    }
}

pub(crate) fn enum_from<T: DeserializeOwned>(idx: usize, raw: String) -> rusqlite::Result<T> {
    serde_json::from_value(serde_json::Value::String(raw))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}
