//! Transaction monitoring queries: rules, transactions, profiles, alerts,
//! reports and the monitoring log.

use super::{enum_from, enum_text, from_json, parse_ts, to_json, ts, MonitoringStore, SqliteStore};
use crate::{
    error::ComplianceResult,
    monitoring::{
        AlertFilter, AlertStatus, ComplianceReport, MonitoringAlert, MonitoringLogEntry,
        MonitoringRule, Transaction, UserRiskProfile,
    },
};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, OptionalExtension, Row};

const TRANSACTION_COLUMNS: &str =
    "id, user_id, tx_type, amount, currency, from_account, to_account, timestamp, metadata, status, risk_score";

const ALERT_COLUMNS: &str = "id, rule_id, transaction_id, user_id, severity, alert_type, description, \
     risk_score, status, metadata, notes, created_at, updated_at";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        tx_type: row.get(2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        from_account: row.get(5)?,
        to_account: row.get(6)?,
        timestamp: parse_ts(7, &row.get::<_, String>(7)?)?,
        metadata: from_json(8, &row.get::<_, String>(8)?)?,
        status: row
            .get::<_, Option<String>>(9)?
            .map(|s| enum_from(9, s))
            .transpose()?,
        risk_score: row.get(10)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<MonitoringAlert> {
    Ok(MonitoringAlert {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        transaction_id: row.get(2)?,
        user_id: row.get(3)?,
        severity: enum_from(4, row.get(4)?)?,
        alert_type: row.get(5)?,
        description: row.get(6)?,
        risk_score: row.get(7)?,
        status: enum_from(8, row.get(8)?)?,
        metadata: from_json(9, &row.get::<_, String>(9)?)?,
        notes: row.get(10)?,
        created_at: parse_ts(11, &row.get::<_, String>(11)?)?,
        updated_at: parse_ts(12, &row.get::<_, String>(12)?)?,
    })
}

impl MonitoringStore for SqliteStore {
    // ── Rules ──────────────────────────────────────────────────

    fn load_monitoring_rules(&self) -> ComplianceResult<Vec<MonitoringRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, rule_type, enabled, parameters, risk_weight, actions
             FROM monitoring_rules
             ORDER BY id ASC",
        )?;
        let defs = stmt
            .query_map([], |row| {
                Ok(serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "name": row.get::<_, String>(1)?,
                    "description": row.get::<_, String>(2)?,
                    "type": row.get::<_, String>(3)?,
                    "enabled": row.get::<_, bool>(4)?,
                    "parameters": from_json::<serde_json::Value>(5, &row.get::<_, String>(5)?)?,
                    "risk_weight": row.get::<_, f64>(6)?,
                    "actions": from_json::<serde_json::Value>(7, &row.get::<_, String>(7)?)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rules = Vec::with_capacity(defs.len());
        for def in defs {
            match serde_json::from_value::<MonitoringRule>(def) {
                Ok(rule) => rules.push(rule),
                Err(e) => log::warn!("skipping malformed stored monitoring rule: {e}"),
            }
        }
        Ok(rules)
    }

    fn upsert_monitoring_rule(&self, rule: &MonitoringRule) -> ComplianceResult<()> {
        self.conn()?.execute(
            "INSERT INTO monitoring_rules
                (id, name, description, rule_type, enabled, parameters, risk_weight, actions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                rule_type = excluded.rule_type,
                enabled = excluded.enabled,
                parameters = excluded.parameters,
                risk_weight = excluded.risk_weight,
                actions = excluded.actions",
            params![
                rule.id,
                rule.name,
                rule.description,
                rule.check.kind(),
                rule.enabled,
                to_json(&rule.check.parameters())?,
                rule.risk_weight,
                to_json(&rule.actions)?,
            ],
        )?;
        Ok(())
    }

    // ── Transactions ───────────────────────────────────────────

    fn record_transaction(&self, tx: &Transaction) -> ComplianceResult<()> {
        let status = tx.status.as_ref().map(enum_text).transpose()?;
        self.conn()?.execute(
            &format!(
                "INSERT OR REPLACE INTO transactions ({TRANSACTION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                tx.id,
                tx.user_id,
                tx.tx_type,
                tx.amount,
                tx.currency,
                tx.from_account,
                tx.to_account,
                ts(&tx.timestamp),
                to_json(&tx.metadata)?,
                status,
                tx.risk_score,
            ],
        )?;
        Ok(())
    }

    fn transactions_for_user_since(&self, user_id: &str, since: DateTime<Utc>) -> ComplianceResult<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE user_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![user_id, ts(&since)], transaction_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn last_activity_before(
        &self,
        user_id: &str,
        before: DateTime<Utc>,
        exclude_id: &str,
    ) -> ComplianceResult<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.conn()?.query_row(
            "SELECT MAX(timestamp) FROM transactions
             WHERE user_id = ?1 AND timestamp < ?2 AND id != ?3",
            params![user_id, ts(&before), exclude_id],
            |row| row.get(0),
        )?;
        Ok(raw.map(|r| parse_ts(0, &r)).transpose()?)
    }

    fn outbound_transfers(
        &self,
        account: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> ComplianceResult<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE from_account = ?1 AND timestamp > ?2 AND timestamp <= ?3
               AND to_account IS NOT NULL
             ORDER BY timestamp ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![account, ts(&after), ts(&until)], transaction_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // ── Profiles ───────────────────────────────────────────────

    fn load_profile(&self, user_id: &str) -> ComplianceResult<Option<UserRiskProfile>> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT profile FROM user_profiles WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    fn save_profile(&self, profile: &UserRiskProfile) -> ComplianceResult<()> {
        self.conn()?.execute(
            "INSERT INTO user_profiles (user_id, profile, last_updated)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                profile = excluded.profile,
                last_updated = excluded.last_updated",
            params![profile.user_id, to_json(profile)?, ts(&profile.last_updated)],
        )?;
        Ok(())
    }

    // ── Alerts ─────────────────────────────────────────────────

    fn insert_alert(&self, alert: &MonitoringAlert) -> ComplianceResult<()> {
        self.conn()?.execute(
            &format!(
                "INSERT INTO monitoring_alerts ({ALERT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                alert.id,
                alert.rule_id,
                alert.transaction_id,
                alert.user_id,
                enum_text(&alert.severity)?,
                alert.alert_type,
                alert.description,
                alert.risk_score,
                enum_text(&alert.status)?,
                to_json(&alert.metadata)?,
                alert.notes,
                ts(&alert.created_at),
                ts(&alert.updated_at),
            ],
        )?;
        Ok(())
    }

    fn alerts(&self, filter: &AlertFilter) -> ComplianceResult<Vec<MonitoringAlert>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(user_id) = &filter.user_id {
            clauses.push("user_id = ?");
            values.push(SqlValue::Text(user_id.clone()));
        }
        if let Some(severity) = &filter.severity {
            clauses.push("severity = ?");
            values.push(SqlValue::Text(enum_text(severity)?));
        }
        if let Some(status) = &filter.status {
            clauses.push("status = ?");
            values.push(SqlValue::Text(enum_text(status)?));
        }
        if let Some(start) = &filter.start {
            clauses.push("created_at >= ?");
            values.push(SqlValue::Text(ts(start)));
        }
        if let Some(end) = &filter.end {
            clauses.push("created_at <= ?");
            values.push(SqlValue::Text(ts(end)));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        values.push(SqlValue::Integer(i64::try_from(filter.limit).unwrap_or(i64::MAX)));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM monitoring_alerts
             {where_clause}
             ORDER BY created_at DESC, id DESC
             LIMIT ?"
        ))?;
        let rows = stmt.query_map(params_from_iter(values), alert_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn alert(&self, id: &str) -> ComplianceResult<Option<MonitoringAlert>> {
        let alert = self
            .conn()?
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM monitoring_alerts WHERE id = ?1"),
                params![id],
                alert_from_row,
            )
            .optional()?;
        Ok(alert)
    }

    fn set_alert_status(
        &self,
        id: &str,
        status: AlertStatus,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> ComplianceResult<bool> {
        let updated = self.conn()?.execute(
            "UPDATE monitoring_alerts
             SET status = ?2, notes = COALESCE(?3, notes), updated_at = ?4
             WHERE id = ?1",
            params![id, enum_text(&status)?, notes, ts(&at)],
        )?;
        Ok(updated > 0)
    }

    // ── Reports and log ────────────────────────────────────────

    fn insert_report(&self, report: &ComplianceReport) -> ComplianceResult<()> {
        self.conn()?.execute(
            "INSERT INTO compliance_reports
                (id, report_type, transaction_id, user_id, rule_id, severity, risk_score, status, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                report.id,
                report.report_type,
                report.transaction_id,
                report.user_id,
                report.rule_id,
                enum_text(&report.severity)?,
                report.risk_score,
                report.status,
                to_json(&report.details)?,
                ts(&report.created_at),
            ],
        )?;
        Ok(())
    }

    fn append_monitoring_log(&self, entry: &MonitoringLogEntry) -> ComplianceResult<()> {
        self.conn()?.execute(
            "INSERT INTO transaction_monitoring_log
                (transaction_id, user_id, risk_score, alert_count, blocked, requires_review, duration_ms, logged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.transaction_id,
                entry.user_id,
                entry.risk_score,
                i64::try_from(entry.alert_count).unwrap_or(i64::MAX),
                entry.blocked,
                entry.requires_review,
                i64::try_from(entry.duration_ms).unwrap_or(i64::MAX),
                ts(&entry.logged_at),
            ],
        )?;
        Ok(())
    }
}

impl SqliteStore {
    /// Stored transaction by id, with its annotation.
    pub fn transaction(&self, id: &str) -> ComplianceResult<Option<Transaction>> {
        let tx = self
            .conn()?
            .query_row(
                &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1"),
                params![id],
                transaction_from_row,
            )
            .optional()?;
        Ok(tx)
    }

    pub fn report_count(&self) -> ComplianceResult<i64> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM compliance_reports", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn monitoring_log_count(&self) -> ComplianceResult<i64> {
        let count = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM transaction_monitoring_log", [], |row| row.get(0))?;
        Ok(count)
    }
}
