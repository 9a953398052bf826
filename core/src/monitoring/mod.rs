//! Transaction Monitor: per-transaction AML analysis.
//!
//! RULE: Rule families never see each other.
//! Every enabled rule is judged independently by its family evaluator;
//! the monitor only combines the hits (composite score, alerts, actions).
//!
//! RULE: One bad rule never aborts an analysis.
//! A family that fails is logged with the rule and transaction ids and
//! counts as not triggered.

pub mod correlation;
pub mod family;
pub mod model;
pub mod profile;
pub mod worker;

pub use family::{EvalContext, RuleCheck, RuleFamily};
pub use model::{
    ActionType, AlertFilter, AlertStatus, AnalysisResult, ComplianceReport, MonitoringAction,
    MonitoringAlert, MonitoringLogEntry, MonitoringRule, RuleHit, Transaction, TransactionStatus,
};
pub use profile::{ProfileBook, RiskLevel, UserRiskProfile};
pub use worker::MonitorHandle;

use crate::{
    cache::ComplianceCache,
    clock::Clock,
    config::{IoConfig, MonitoringConfig},
    error::{ComplianceError, ComplianceResult},
    event::{ComplianceEvent, EventPublisher},
    snapshot::Registry,
    store::{bounded, MonitoringStore},
    types::{clamp_risk, Severity},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

const REPORT_TYPE: &str = "monitoring_alert";
const CORRELATION_RULE_ID: &str = "alert-correlation";
const CORRELATION_SCAN_LIMIT: usize = 1000;

pub struct TransactionMonitor {
    store: Arc<dyn MonitoringStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    rules: Registry<Vec<MonitoringRule>>,
    writer: tokio::sync::Mutex<()>,
    profiles: ProfileBook,
    config: MonitoringConfig,
    io: IoConfig,
}

impl TransactionMonitor {
    pub fn new(
        store: Arc<dyn MonitoringStore>,
        cache: Arc<dyn ComplianceCache>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        config: MonitoringConfig,
        io: IoConfig,
    ) -> Self {
        let profiles = ProfileBook::new(store.clone(), cache, clock.clone(), config.clone(), io.clone());
        Self {
            rules: Registry::new(Vec::new(), clock.now()),
            writer: tokio::sync::Mutex::new(()),
            store,
            publisher,
            clock,
            profiles,
            config,
            io,
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Load every stored monitoring rule; only enabled ones are evaluated.
    /// Returns how many were loaded.
    pub async fn initialize(&self) -> ComplianceResult<usize> {
        let _guard = self.writer.lock().await;
        let store = self.store.clone();
        let mut rules = bounded("monitor.load_rules", self.io.timeout(), move || {
            store.load_monitoring_rules()
        })
        .await?;
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        let count = rules.len();
        let generation = self.rules.replace(rules, self.clock.now());
        log::info!("monitoring rules loaded count={count} generation={generation}");
        Ok(count)
    }

    /// Persist a monitoring rule and publish it in the next generation.
    pub async fn upsert_rule(&self, rule: MonitoringRule) -> ComplianceResult<()> {
        rule.check.validate()?;
        let _guard = self.writer.lock().await;
        let store = self.store.clone();
        let stored = rule.clone();
        bounded("monitor.upsert_rule", self.io.timeout(), move || {
            store.upsert_monitoring_rule(&stored)
        })
        .await?;

        let rule_id = rule.id.clone();
        self.rules.update(self.clock.now(), |rules| {
            rules.retain(|r| r.id != rule.id);
            rules.push(rule.clone());
            rules.sort_by(|a, b| a.id.cmp(&b.id));
        });
        log::info!("monitoring rule={rule_id} upserted");
        Ok(())
    }

    /// Rules of the current generation, ordered by id.
    pub fn rules(&self) -> Vec<MonitoringRule> {
        self.rules.load().data.clone()
    }

    /// Judge one transaction: score, alerts, enforcement actions, profile
    /// update and alert correlation. The user's profile is locked for the
    /// whole call.
    pub async fn analyze_transaction(&self, tx: &Transaction) -> ComplianceResult<AnalysisResult> {
        tx.validate()?;
        let started = Instant::now();
        let _lease = self.profiles.lease(&tx.user_id).await;
        let mut profile = self.profiles.load(&tx.user_id, Some(&tx.id)).await?;

        let hits = self.evaluate(tx, &profile).await?;
        let risk_score = clamp_risk(hits.iter().map(|(rule, hit)| hit.score * rule.risk_weight).sum());

        let now = self.clock.now();
        let mut result = AnalysisResult {
            transaction_id: tx.id.clone(),
            user_id: tx.user_id.clone(),
            risk_score,
            alerts: Vec::with_capacity(hits.len()),
            requires_review: false,
            blocked: false,
            flagged: false,
            reports: Vec::new(),
            duration_ms: 0,
        };

        for (rule, hit) in &hits {
            let alert = self.raise_alert(rule, hit, tx, now).await?;
            for action in rule.actions.iter().filter(|a| hit.score >= a.threshold) {
                match action.action_type {
                    ActionType::Block => result.blocked = true,
                    ActionType::Review => result.requires_review = true,
                    ActionType::Flag => result.flagged = true,
                    ActionType::Report => {
                        let report_id = self.file_report(rule, hit, tx, &alert, now).await?;
                        result.reports.push(report_id);
                    }
                    ActionType::Alert => {}
                }
            }
            result.alerts.push(alert);
        }

        profile.observe(tx, risk_score, &self.config, now);
        self.profiles.record(profile).await?;

        if !result.alerts.is_empty() {
            match self.correlate(tx, now).await {
                Ok(Some(pattern)) => result.alerts.push(pattern),
                Ok(None) => {}
                Err(e) => log::warn!("user={} alert correlation skipped: {e}", tx.user_id),
            }
        }

        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if result.blocked {
            log::warn!(
                "tx={} user={} blocked risk_score={:.1}",
                tx.id,
                tx.user_id,
                result.risk_score
            );
        }
        self.log_analysis(&result, now).await;
        Ok(result)
    }

    /// Analyze, then write the status and risk score back to the stored
    /// transaction.
    pub async fn process_transaction(&self, tx: &Transaction) -> ComplianceResult<AnalysisResult> {
        let result = self.analyze_transaction(tx).await?;
        let mut annotated = tx.clone();
        annotated.status = Some(result.status());
        annotated.risk_score = Some(result.risk_score);

        let store = self.store.clone();
        bounded("monitor.record_transaction", self.io.timeout(), move || {
            store.record_transaction(&annotated)
        })
        .await?;
        log::debug!("tx={} recorded status={:?}", tx.id, result.status());
        Ok(result)
    }

    pub async fn get_alerts(&self, filter: &AlertFilter) -> ComplianceResult<Vec<MonitoringAlert>> {
        let store = self.store.clone();
        let filter = filter.clone();
        bounded("monitor.alerts", self.io.timeout(), move || store.alerts(&filter)).await
    }

    pub async fn get_alert(&self, id: &str) -> ComplianceResult<MonitoringAlert> {
        let store = self.store.clone();
        let owned = id.to_string();
        bounded("monitor.alert", self.io.timeout(), move || store.alert(&owned))
            .await?
            .ok_or_else(|| ComplianceError::not_found("alert", id))
    }

    /// Move an alert forward in its lifecycle.
    pub async fn update_alert_status(
        &self,
        id: &str,
        status: AlertStatus,
        notes: Option<String>,
    ) -> ComplianceResult<MonitoringAlert> {
        let current = self.get_alert(id).await?;
        if !current.status.can_transition_to(status) {
            return Err(ComplianceError::InvalidTransition {
                from: current.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        self.write_status(current, status, notes).await
    }

    /// Operator correction: any status may be set, but the reason is required.
    pub async fn correct_alert_status(
        &self,
        id: &str,
        status: AlertStatus,
        notes: String,
    ) -> ComplianceResult<MonitoringAlert> {
        if notes.trim().is_empty() {
            return Err(ComplianceError::validation("notes", "a correction needs a reason"));
        }
        let current = self.get_alert(id).await?;
        log::info!(
            "alert={id} status corrected {} -> {}",
            current.status.as_str(),
            status.as_str()
        );
        self.write_status(current, status, Some(notes)).await
    }

    /// The user's profile as the next analysis would see it.
    pub async fn profile(&self, user_id: &str) -> ComplianceResult<UserRiskProfile> {
        let _lease = self.profiles.lease(user_id).await;
        self.profiles.load(user_id, None).await
    }

    /// Persist every staged profile now.
    pub async fn flush_profiles(&self) -> ComplianceResult<usize> {
        self.profiles.flush().await
    }

    pub fn pending_profiles(&self) -> usize {
        self.profiles.dirty_count()
    }

    // ── Internals ──────────────────────────────────────────────

    /// Run every enabled rule against one consistent rule generation.
    async fn evaluate(
        &self,
        tx: &Transaction,
        profile: &UserRiskProfile,
    ) -> ComplianceResult<Vec<(MonitoringRule, RuleHit)>> {
        let snapshot = self.rules.load();
        let store = self.store.clone();
        let (tx, profile) = (tx.clone(), profile.clone());
        bounded("monitor.evaluate", self.io.timeout(), move || {
            let ctx = EvalContext {
                transaction: &tx,
                profile: &profile,
                store: store.as_ref(),
            };
            let mut hits = Vec::new();
            for rule in snapshot.data.iter().filter(|r| r.enabled) {
                match family::evaluate_check(&rule.check, &ctx) {
                    Ok(Some(hit)) => {
                        log::debug!("tx={} rule={} triggered score={:.1}", tx.id, rule.id, hit.score);
                        hits.push((rule.clone(), hit));
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!(
                        "tx={} user={} rule={} failed, treated as not triggered: {e}",
                        tx.id,
                        tx.user_id,
                        rule.id
                    ),
                }
            }
            Ok(hits)
        })
        .await
    }

    async fn raise_alert(
        &self,
        rule: &MonitoringRule,
        hit: &RuleHit,
        tx: &Transaction,
        now: DateTime<Utc>,
    ) -> ComplianceResult<MonitoringAlert> {
        let alert = MonitoringAlert {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            transaction_id: tx.id.clone(),
            user_id: tx.user_id.clone(),
            severity: Severity::from_score(hit.score),
            alert_type: rule.check.kind().to_string(),
            description: hit.reason.clone(),
            risk_score: hit.score,
            status: AlertStatus::New,
            metadata: json!({
                "rule_name": rule.name,
                "confidence": hit.confidence,
                "details": hit.details,
            }),
            notes: None,
            created_at: now,
            updated_at: now,
        };
        self.persist_alert(&alert).await?;
        Ok(alert)
    }

    async fn persist_alert(&self, alert: &MonitoringAlert) -> ComplianceResult<()> {
        let store = self.store.clone();
        let stored = alert.clone();
        bounded("monitor.insert_alert", self.io.timeout(), move || store.insert_alert(&stored)).await?;
        self.publish(ComplianceEvent::AlertRaised(alert.clone()));
        Ok(())
    }

    async fn file_report(
        &self,
        rule: &MonitoringRule,
        hit: &RuleHit,
        tx: &Transaction,
        alert: &MonitoringAlert,
        now: DateTime<Utc>,
    ) -> ComplianceResult<String> {
        let report = ComplianceReport {
            id: uuid::Uuid::new_v4().to_string(),
            report_type: REPORT_TYPE.to_string(),
            transaction_id: tx.id.clone(),
            user_id: tx.user_id.clone(),
            rule_id: rule.id.clone(),
            severity: alert.severity,
            risk_score: hit.score,
            status: "pending".to_string(),
            details: json!({
                "transaction": tx,
                "rule_name": rule.name,
                "alert_id": alert.id,
                "reason": hit.reason,
                "details": hit.details,
            }),
            created_at: now,
        };
        let store = self.store.clone();
        let stored = report.clone();
        bounded("monitor.insert_report", self.io.timeout(), move || store.insert_report(&stored)).await?;

        log::info!("report={} filed tx={} rule={}", report.id, tx.id, rule.id);
        self.publish(ComplianceEvent::ReportFiled {
            report_id: report.id.clone(),
            transaction_id: report.transaction_id,
            rule_id: report.rule_id,
            severity: report.severity,
        });
        Ok(report.id)
    }

    /// Look at the user's open alerts inside the correlation window.
    /// Returns the synthesized pattern alert, if one was raised.
    async fn correlate(&self, tx: &Transaction, now: DateTime<Utc>) -> ComplianceResult<Option<MonitoringAlert>> {
        let filter = AlertFilter {
            start: Some(now - self.config.correlation_window()),
            limit: CORRELATION_SCAN_LIMIT,
            ..AlertFilter::for_user(&tx.user_id)
        };
        let recent = self.get_alerts(&filter).await?;
        let verdict = correlation::assess(&recent);

        if verdict.escalate() {
            log::warn!(
                "user={} escalated elevated_alerts={}",
                tx.user_id,
                verdict.elevated.len()
            );
            self.publish(ComplianceEvent::Escalation {
                user_id: tx.user_id.clone(),
                reason: "multiple high severity alerts".to_string(),
                alert_count: verdict.elevated.len(),
                alert_ids: verdict.elevated.clone(),
            });
        }

        if !verdict.synthesize_pattern {
            return Ok(None);
        }
        let pattern = MonitoringAlert {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: CORRELATION_RULE_ID.to_string(),
            transaction_id: tx.id.clone(),
            user_id: tx.user_id.clone(),
            severity: Severity::Critical,
            alert_type: correlation::PATTERN_ALERT_TYPE.to_string(),
            description: format!(
                "{} different alert types within the correlation window",
                verdict.distinct_types.len()
            ),
            risk_score: correlation::PATTERN_ALERT_SCORE,
            status: AlertStatus::New,
            metadata: json!({ "alert_types": verdict.distinct_types }),
            notes: None,
            created_at: now,
            updated_at: now,
        };
        self.persist_alert(&pattern).await?;
        Ok(Some(pattern))
    }

    async fn write_status(
        &self,
        mut alert: MonitoringAlert,
        status: AlertStatus,
        notes: Option<String>,
    ) -> ComplianceResult<MonitoringAlert> {
        let now = self.clock.now();
        let store = self.store.clone();
        let id = alert.id.clone();
        let stored_notes = notes.clone();
        let found = bounded("monitor.set_alert_status", self.io.timeout(), move || {
            store.set_alert_status(&id, status, stored_notes.as_deref(), now)
        })
        .await?;
        if !found {
            return Err(ComplianceError::not_found("alert", alert.id));
        }
        alert.status = status;
        alert.updated_at = now;
        if notes.is_some() {
            alert.notes = notes;
        }
        Ok(alert)
    }

    async fn log_analysis(&self, result: &AnalysisResult, now: DateTime<Utc>) {
        let entry = MonitoringLogEntry {
            transaction_id: result.transaction_id.clone(),
            user_id: result.user_id.clone(),
            risk_score: result.risk_score,
            alert_count: result.alerts.len(),
            blocked: result.blocked,
            requires_review: result.requires_review,
            duration_ms: result.duration_ms,
            logged_at: now,
        };
        let store = self.store.clone();
        if let Err(e) = bounded("monitor.log", self.io.timeout(), move || {
            store.append_monitoring_log(&entry)
        })
        .await
        {
            log::warn!("tx={} monitoring log write failed: {e}", result.transaction_id);
        }
    }

    fn publish(&self, event: ComplianceEvent) {
        let channel = event.channel();
        if let Err(e) = self.publisher.publish(event) {
            log::warn!("channel={channel} publish failed: {e}");
        }
    }
}
