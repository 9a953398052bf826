use super::family::RuleCheck;
use crate::{
    error::{ComplianceError, ComplianceResult},
    types::{EntityId, Severity, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Transactions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Flagged,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: EntityId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub from_account: Option<String>,
    #[serde(default)]
    pub to_account: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
    /// Written back by `TransactionMonitor::process_transaction`.
    #[serde(default)]
    pub status: Option<TransactionStatus>,
    #[serde(default)]
    pub risk_score: Option<f64>,
}

impl Transaction {
    pub fn validate(&self) -> ComplianceResult<()> {
        if self.id.trim().is_empty() {
            return Err(ComplianceError::validation("id", "must not be empty"));
        }
        if self.user_id.trim().is_empty() {
            return Err(ComplianceError::validation("user_id", "must not be empty"));
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(ComplianceError::validation(
                "amount",
                format!("must be a non-negative number, got {}", self.amount),
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(ComplianceError::validation("currency", "must not be empty"));
        }
        Ok(())
    }
}

// ── Rules ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Alert,
    Flag,
    Review,
    Block,
    Report,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Applies when the rule's own score reaches this value.
    pub threshold: f64,
}

/// A monitoring rule with typed family parameters.
/// On the wire it keeps the `{ "type": .., "parameters": {..} }` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MonitoringRuleDef", into = "MonitoringRuleDef")]
pub struct MonitoringRule {
    pub id: EntityId,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub check: RuleCheck,
    pub risk_weight: f64,
    pub actions: Vec<MonitoringAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MonitoringRuleDef {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default = "unit_weight")]
    pub risk_weight: f64,
    #[serde(default)]
    pub actions: Vec<MonitoringAction>,
}

fn enabled_by_default() -> bool {
    true
}

fn unit_weight() -> f64 {
    1.0
}

impl TryFrom<MonitoringRuleDef> for MonitoringRule {
    type Error = ComplianceError;

    fn try_from(def: MonitoringRuleDef) -> Result<Self, Self::Error> {
        if def.id.trim().is_empty() {
            return Err(ComplianceError::validation("id", "must not be empty"));
        }
        if !def.risk_weight.is_finite() || def.risk_weight < 0.0 {
            return Err(ComplianceError::validation(
                "risk_weight",
                format!("must be a non-negative number, got {}", def.risk_weight),
            ));
        }
        let check = RuleCheck::from_parts(&def.rule_type, def.parameters)?;
        Ok(Self {
            id: def.id,
            name: def.name,
            description: def.description,
            enabled: def.enabled,
            check,
            risk_weight: def.risk_weight,
            actions: def.actions,
        })
    }
}

impl From<MonitoringRule> for MonitoringRuleDef {
    fn from(rule: MonitoringRule) -> Self {
        Self {
            id: rule.id,
            name: rule.name,
            description: rule.description,
            enabled: rule.enabled,
            rule_type: rule.check.kind().to_string(),
            parameters: rule.check.parameters(),
            risk_weight: rule.risk_weight,
            actions: rule.actions,
        }
    }
}

/// What a triggered rule family reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleHit {
    /// Family-specific score, 0..=100.
    pub score: f64,
    pub reason: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub details: Value,
}

// ── Alerts ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Investigating,
    Resolved,
    FalsePositive,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Acknowledged => "acknowledged",
            Self::Investigating => "investigating",
            Self::Resolved => "resolved",
            Self::FalsePositive => "false_positive",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::FalsePositive)
    }

    /// Forward-only lifecycle. Corrections go through
    /// `TransactionMonitor::correct_alert_status`.
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        use AlertStatus::*;
        matches!(
            (self, next),
            (New, Acknowledged | Investigating | Resolved | FalsePositive)
                | (Acknowledged, Investigating | Resolved | FalsePositive)
                | (Investigating, Resolved | FalsePositive)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringAlert {
    pub id: EntityId,
    pub rule_id: EntityId,
    pub transaction_id: EntityId,
    pub user_id: UserId,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub description: String,
    pub risk_score: f64,
    pub status: AlertStatus,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertFilter {
    pub user_id: Option<UserId>,
    pub severity: Option<Severity>,
    pub status: Option<AlertStatus>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for AlertFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            severity: None,
            status: None,
            start: None,
            end: None,
            limit: 100,
        }
    }
}

impl AlertFilter {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Self::default()
        }
    }
}

// ── Reports and results ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub id: EntityId,
    pub report_type: String,
    pub transaction_id: EntityId,
    pub user_id: UserId,
    pub rule_id: EntityId,
    pub severity: Severity,
    pub risk_score: f64,
    pub status: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringLogEntry {
    pub transaction_id: EntityId,
    pub user_id: UserId,
    pub risk_score: f64,
    pub alert_count: usize,
    pub blocked: bool,
    pub requires_review: bool,
    pub duration_ms: u64,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub transaction_id: EntityId,
    pub user_id: UserId,
    /// Weighted composite over triggered rules, 0..=100.
    pub risk_score: f64,
    pub alerts: Vec<MonitoringAlert>,
    pub requires_review: bool,
    pub blocked: bool,
    pub flagged: bool,
    pub reports: Vec<EntityId>,
    pub duration_ms: u64,
}

impl AnalysisResult {
    pub fn status(&self) -> TransactionStatus {
        if self.blocked {
            TransactionStatus::Rejected
        } else if self.requires_review || self.flagged {
            TransactionStatus::Flagged
        } else {
            TransactionStatus::Approved
        }
    }
}
