//! The compliance engine: one decision over rules, screening and monitoring.
//!
//! DECISION ORDER (fixed):
//!   1. Rule Engine       (context against every enabled rule)
//!   2. Sanctions Screener (when a subject is supplied)
//!   3. Transaction Monitor (when a transaction is supplied)
//!
//! RULES:
//!   - Components never call each other; only the engine combines them.
//!   - Block beats review beats permit.
//!   - A screening `error` is never read as clear: it asks for review.

use crate::{
    cache::ComplianceCache,
    clock::Clock,
    config::{EngineConfig, RuleCatalog},
    error::ComplianceResult,
    event::EventPublisher,
    monitoring::{AnalysisResult, Transaction, TransactionMonitor},
    rules::{RuleAction, RuleContext, RuleEngine, RuleEvaluationResult},
    screening::{SanctionsScreener, ScreeningRequest, ScreeningResult, ScreeningStatus},
    store::{MonitoringStore, RuleStore, SanctionsStore},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Permit,
    Review,
    Block,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionRequest {
    pub context: RuleContext,
    pub screening: Option<ScreeningRequest>,
    pub transaction: Option<Transaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub outcome: DecisionOutcome,
    pub reasons: Vec<String>,
    pub rule_results: Vec<RuleEvaluationResult>,
    pub screening: Option<ScreeningResult>,
    pub monitoring: Option<AnalysisResult>,
}

/// Combine the three component outputs into one outcome with reasons.
pub fn combine(
    rule_results: &[RuleEvaluationResult],
    screening: Option<&ScreeningResult>,
    monitoring: Option<&AnalysisResult>,
) -> (DecisionOutcome, Vec<String>) {
    let mut block = Vec::new();
    let mut review = Vec::new();

    for result in rule_results {
        match result.action {
            Some(RuleAction::Reject) => block.push(format!("rule {} rejected", result.rule_id)),
            Some(RuleAction::ManualReview) => review.push(format!("rule {} requires manual review", result.rule_id)),
            Some(RuleAction::Allow) | None => {}
        }
    }

    if let Some(screening) = screening {
        match screening.status {
            ScreeningStatus::ConfirmedMatch => block.push(format!(
                "confirmed sanctions match{}",
                screening
                    .matches
                    .first()
                    .map(|m| format!(" on {} ({})", m.list_name, m.entry_id))
                    .unwrap_or_default()
            )),
            ScreeningStatus::PotentialMatch => review.push(format!(
                "potential sanctions match ({} candidates)",
                screening.matches.len()
            )),
            ScreeningStatus::Error => review.push("sanctions screening unavailable".to_string()),
            ScreeningStatus::Clear => {}
        }
    }

    if let Some(monitoring) = monitoring {
        if monitoring.blocked {
            block.push(format!("transaction blocked by monitoring (risk {:.1})", monitoring.risk_score));
        } else if monitoring.requires_review || monitoring.flagged {
            review.push(format!("transaction flagged by monitoring (risk {:.1})", monitoring.risk_score));
        }
    }

    if !block.is_empty() {
        block.extend(review);
        (DecisionOutcome::Block, block)
    } else if !review.is_empty() {
        (DecisionOutcome::Review, review)
    } else {
        (DecisionOutcome::Permit, Vec::new())
    }
}

pub struct ComplianceEngine {
    pub rules: RuleEngine,
    pub screener: Arc<SanctionsScreener>,
    pub monitor: Arc<TransactionMonitor>,
}

impl ComplianceEngine {
    /// Wire every component onto one store, cache, publisher and clock.
    pub fn new<S>(
        store: Arc<S>,
        cache: Arc<dyn ComplianceCache>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self
    where
        S: RuleStore + SanctionsStore + MonitoringStore + 'static,
    {
        let rules = RuleEngine::new(store.clone(), clock.clone(), config.io.clone());
        let screener = Arc::new(SanctionsScreener::new(
            store.clone(),
            cache.clone(),
            clock.clone(),
            config.screening.clone(),
            config.io.clone(),
        ));
        let monitor = Arc::new(TransactionMonitor::new(
            store,
            cache,
            publisher,
            clock,
            config.monitoring.clone(),
            config.io.clone(),
        ));
        Self {
            rules,
            screener,
            monitor,
        }
    }

    /// Load rules, sanctions lists and monitoring rules; start the list refresh.
    pub async fn initialize(&self) -> ComplianceResult<()> {
        let rules = self.rules.load_rules().await?;
        self.screener.initialize().await?;
        let monitoring = self.monitor.initialize().await?;
        let stats = self.screener.stats();
        log::info!(
            "engine ready rules={rules} lists={} entries={} monitoring_rules={monitoring}",
            stats.lists,
            stats.entries
        );
        Ok(())
    }

    /// Add every catalog rule the registry does not already hold, enabled or not.
    /// Returns how many rules were added.
    pub async fn seed(&self, catalog: &RuleCatalog) -> ComplianceResult<usize> {
        let mut added = 0;
        for rule in &catalog.compliance_rules {
            if self.rules.get_rule(&rule.id).is_none() {
                self.rules.add_rule(rule.clone()).await?;
                added += 1;
            }
        }
        let known: Vec<String> = self.monitor.rules().into_iter().map(|r| r.id).collect();
        for rule in &catalog.monitoring_rules {
            if !known.contains(&rule.id) {
                self.monitor.upsert_rule(rule.clone()).await?;
                added += 1;
            }
        }
        log::info!("rule catalog seeded added={added}");
        Ok(added)
    }

    pub async fn decide(&self, request: &DecisionRequest) -> ComplianceResult<Decision> {
        let mut context = request.context.clone();
        if let Some(tx) = &request.transaction {
            if context.lookup("transaction").is_none() {
                context = context.with("transaction", serde_json::to_value(tx)?);
            }
        }
        let rule_results = self.rules.evaluate_rules(&context, None);

        let screening = match &request.screening {
            Some(subject) => Some(self.screener.screen(subject).await?),
            None => None,
        };
        let monitoring = match &request.transaction {
            Some(tx) => Some(self.monitor.process_transaction(tx).await?),
            None => None,
        };

        let (outcome, reasons) = combine(&rule_results, screening.as_ref(), monitoring.as_ref());
        if outcome != DecisionOutcome::Permit {
            log::info!("decision={outcome:?} reasons={}", reasons.join("; "));
        }
        Ok(Decision {
            outcome,
            reasons,
            rule_results,
            screening,
            monitoring,
        })
    }

    /// Stop background refresh and persist staged profiles.
    pub async fn shutdown(&self) -> ComplianceResult<()> {
        self.screener.shutdown().await?;
        let flushed = self.monitor.flush_profiles().await?;
        log::info!("engine stopped profiles_flushed={flushed}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule_result(id: &str, action: Option<RuleAction>) -> RuleEvaluationResult {
        RuleEvaluationResult {
            rule_id: id.into(),
            rule_name: id.into(),
            triggered: action.is_some(),
            passed: matches!(action, None | Some(RuleAction::Allow)),
            action,
            error: None,
        }
    }

    fn screening(status: ScreeningStatus) -> ScreeningResult {
        ScreeningResult {
            request_id: "r".into(),
            status,
            matches: vec![],
            lists_checked: vec![],
            screening_time_ms: 0,
            screened_at: Utc::now(),
            error: None,
        }
    }

    #[test]
    fn nothing_fired_permits() {
        let (outcome, reasons) = combine(&[rule_result("a", None)], Some(&screening(ScreeningStatus::Clear)), None);
        assert_eq!(outcome, DecisionOutcome::Permit);
        assert!(reasons.is_empty());
    }

    #[test]
    fn screening_error_is_never_clear() {
        let (outcome, _) = combine(&[], Some(&screening(ScreeningStatus::Error)), None);
        assert_eq!(outcome, DecisionOutcome::Review);
    }

    #[test]
    fn reject_outranks_review() {
        let results = [
            rule_result("kyc", Some(RuleAction::ManualReview)),
            rule_result("jurisdiction", Some(RuleAction::Reject)),
        ];
        let (outcome, reasons) = combine(&results, None, None);
        assert_eq!(outcome, DecisionOutcome::Block);
        assert_eq!(reasons.len(), 2);
        assert!(reasons[0].contains("jurisdiction"));
    }

    #[test]
    fn confirmed_match_blocks() {
        let (outcome, _) = combine(&[], Some(&screening(ScreeningStatus::ConfirmedMatch)), None);
        assert_eq!(outcome, DecisionOutcome::Block);
    }
}
