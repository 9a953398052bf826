//! Rule Engine: declarative compliance rules evaluated against a context.
//!
//! RULE: The registry is authoritative for the process.
//! Every mutation is persisted first and then published as a new registry
//! generation; evaluators read one generation for the whole call.
//!
//! RULE: One bad rule never aborts evaluation of the rest.
//! A rule whose condition fails to evaluate is logged, reported as not
//! triggered, and carries the failure in `RuleEvaluationResult::error`.

pub mod condition;

pub use condition::{CompareOp, Condition, RuleContext, Truth};

use crate::{
    clock::Clock,
    config::IoConfig,
    error::{ComplianceError, ComplianceResult},
    snapshot::Registry,
    store::{bounded, RuleStore},
    types::EntityId,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

// ── Data model ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Kyc,
    Aml,
    Jurisdiction,
    Transaction,
    Accreditation,
    Sanctions,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kyc => "kyc",
            Self::Aml => "aml",
            Self::Jurisdiction => "jurisdiction",
            Self::Transaction => "transaction",
            Self::Accreditation => "accreditation",
            Self::Sanctions => "sanctions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Reject,
    ManualReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRule {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// When this holds, the rule fires and `action` applies.
    pub condition: Condition,
    pub action: RuleAction,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn enabled_by_default() -> bool {
    true
}

impl ComplianceRule {
    pub fn validate(&self) -> ComplianceResult<()> {
        if self.id.trim().is_empty() {
            return Err(ComplianceError::validation("id", "must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(ComplianceError::validation("name", "must not be empty"));
        }
        self.condition.validate("condition")
    }

    /// Evaluate this rule alone. Errors are downgraded to "not triggered".
    pub fn evaluate(&self, ctx: &RuleContext) -> RuleEvaluationResult {
        match self.condition.evaluate(ctx) {
            Ok(truth) => RuleEvaluationResult::from_truth(self, truth),
            Err(e) => {
                log::warn!(
                    "rule={} type={} evaluation failed, treating as not triggered: {e}",
                    self.id,
                    self.rule_type.as_str()
                );
                let mut result = RuleEvaluationResult::from_truth(self, Truth::Unknown);
                result.error = Some(e.to_string());
                result
            }
        }
    }

    fn apply(&mut self, patch: RulePatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(rule_type) = patch.rule_type {
            self.rule_type = rule_type;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(condition) = patch.condition {
            self.condition = condition;
        }
        if let Some(action) = patch.action {
            self.action = action;
        }
        if let Some(metadata) = patch.metadata {
            self.metadata = metadata;
        }
    }
}

/// Partial update for `RuleEngine::update_rule`. Absent fields are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub rule_type: Option<RuleType>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
    pub condition: Option<Condition>,
    pub action: Option<RuleAction>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluationResult {
    pub rule_id: EntityId,
    pub rule_name: String,
    pub triggered: bool,
    pub passed: bool,
    pub action: Option<RuleAction>,
    pub error: Option<String>,
}

impl RuleEvaluationResult {
    fn from_truth(rule: &ComplianceRule, truth: Truth) -> Self {
        let triggered = truth.is_true();
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            triggered,
            passed: !triggered || rule.action == RuleAction::Allow,
            action: triggered.then_some(rule.action),
            error: None,
        }
    }
}

/// Aggregate decision over one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleVerdict {
    pub passed: bool,
    pub requires_review: bool,
    pub rejected: bool,
}

impl RuleVerdict {
    pub fn from_results(results: &[RuleEvaluationResult]) -> Self {
        Self {
            passed: results.iter().all(|r| r.passed),
            requires_review: results
                .iter()
                .any(|r| r.action == Some(RuleAction::ManualReview)),
            rejected: results.iter().any(|r| r.action == Some(RuleAction::Reject)),
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

type RuleSet = BTreeMap<EntityId, ComplianceRule>;

pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    registry: Registry<RuleSet>,
    writer: Mutex<()>,
    clock: Arc<dyn Clock>,
    io: IoConfig,
}

impl RuleEngine {
    /// An engine with an empty registry. Call `load_rules` to populate it.
    pub fn new(store: Arc<dyn RuleStore>, clock: Arc<dyn Clock>, io: IoConfig) -> Self {
        let registry = Registry::new(RuleSet::new(), clock.now());
        Self {
            store,
            registry,
            writer: Mutex::new(()),
            clock,
            io,
        }
    }

    pub fn generation(&self) -> u64 {
        self.registry.generation()
    }

    /// Replace the registry with the rules held by the store.
    /// Disabled rules are kept so they stay editable; only enabled ones
    /// are evaluated. Rules that fail validation are skipped.
    pub async fn load_rules(&self) -> ComplianceResult<usize> {
        let _guard = self.writer.lock().await;
        let store = self.store.clone();
        let rules = bounded("rules.load", self.io.timeout(), move || store.load_rules()).await?;

        let mut set = RuleSet::new();
        for rule in rules {
            match rule.validate() {
                Ok(()) => {
                    set.insert(rule.id.clone(), rule);
                }
                Err(e) => log::warn!("skipping invalid stored rule id={} error={e}", rule.id),
            }
        }
        let count = set.len();
        let enabled = set.values().filter(|r| r.enabled).count();
        let generation = self.registry.replace(set, self.clock.now());
        log::info!("rules loaded count={count} enabled={enabled} generation={generation}");
        Ok(count)
    }

    pub async fn add_rule(&self, rule: ComplianceRule) -> ComplianceResult<()> {
        rule.validate()?;
        let _guard = self.writer.lock().await;
        if self.registry.load().data.contains_key(&rule.id) {
            return Err(ComplianceError::validation(
                "id",
                format!("rule '{}' already exists", rule.id),
            ));
        }
        self.persist(rule.clone()).await?;
        log::info!("rule={} added", rule.id);
        self.registry.update(self.clock.now(), |set| {
            set.insert(rule.id.clone(), rule.clone());
        });
        Ok(())
    }

    pub async fn update_rule(&self, id: &str, patch: RulePatch) -> ComplianceResult<ComplianceRule> {
        let _guard = self.writer.lock().await;
        let mut rule = self
            .registry
            .load()
            .data
            .get(id)
            .cloned()
            .ok_or_else(|| ComplianceError::not_found("rule", id))?;
        rule.apply(patch);
        rule.validate()?;

        self.persist(rule.clone()).await?;
        log::info!("rule={id} updated");
        self.registry.update(self.clock.now(), |set| {
            set.insert(rule.id.clone(), rule.clone());
        });
        Ok(rule)
    }

    pub async fn remove_rule(&self, id: &str) -> ComplianceResult<()> {
        let _guard = self.writer.lock().await;
        let store = self.store.clone();
        let key = id.to_string();
        let deleted = bounded("rules.delete", self.io.timeout(), move || {
            store.delete_rule(&key)
        })
        .await?;

        let in_registry = self.registry.load().data.contains_key(id);
        if !deleted && !in_registry {
            return Err(ComplianceError::not_found("rule", id));
        }
        self.registry.update(self.clock.now(), |set| {
            set.remove(id);
        });
        log::info!("rule={id} removed");
        Ok(())
    }

    pub fn get_rule(&self, id: &str) -> Option<ComplianceRule> {
        self.registry.load().data.get(id).cloned()
    }

    /// Rules in evaluation order, optionally restricted to one type.
    pub fn get_rules(&self, rule_type: Option<RuleType>) -> Vec<ComplianceRule> {
        let snapshot = self.registry.load();
        let mut rules: Vec<ComplianceRule> = snapshot
            .data
            .values()
            .filter(|r| rule_type.map_or(true, |t| r.rule_type == t))
            .cloned()
            .collect();
        rules.sort_by(evaluation_order);
        rules
    }

    /// One result per enabled rule of `rule_type` (or of every type).
    pub fn evaluate_rules(
        &self,
        ctx: &RuleContext,
        rule_type: Option<RuleType>,
    ) -> Vec<RuleEvaluationResult> {
        let snapshot = self.registry.load();
        let mut applicable: Vec<&ComplianceRule> = snapshot
            .data
            .values()
            .filter(|r| r.enabled && rule_type.map_or(true, |t| r.rule_type == t))
            .collect();
        applicable.sort_by(|a, b| evaluation_order(a, b));

        let results: Vec<RuleEvaluationResult> =
            applicable.into_iter().map(|rule| rule.evaluate(ctx)).collect();

        let fired = results.iter().filter(|r| r.triggered).count();
        log::debug!(
            "rules evaluated generation={} count={} fired={fired}",
            snapshot.generation,
            results.len()
        );
        results
    }

    async fn persist(&self, rule: ComplianceRule) -> ComplianceResult<()> {
        let store = self.store.clone();
        bounded("rules.upsert", self.io.timeout(), move || store.upsert_rule(&rule)).await
    }
}

/// Priority descending, then id.
fn evaluation_order(a: &ComplianceRule, b: &ComplianceRule) -> Ordering {
    b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
}
