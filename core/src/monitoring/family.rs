//! Rule families: one evaluator per monitoring rule type.
//!
//! RULE: Windows are anchored at the transaction's own timestamp and
//! include the transaction under analysis. History never contains an
//! earlier record with the same id, so re-analysis does not double count.
//!
//! RULE: Within a family, sub-checks run in configured order and the
//! first one that triggers is the family's hit.

use super::model::{RuleHit, Transaction};
use super::profile::UserRiskProfile;
use crate::{
    error::{ComplianceError, ComplianceResult},
    store::MonitoringStore,
};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

// ── Constants ────────────────────────────────────────────────────────────────

const STRUCTURING_SCORE: f64 = 80.0;
const RAPID_MOVEMENT_SCORE: f64 = 70.0;
const ROUND_AMOUNT_SCORE: f64 = 40.0;
const NEW_COUNTERPARTY_SCORE: f64 = 35.0;
const DORMANT_SCORE: f64 = 60.0;
const UNUSUAL_TIME_SCORE: f64 = 25.0;
const BELOW_MINIMUM_SCORE: f64 = 30.0;

/// Lower edge of the structuring band as a share of the threshold.
const STRUCTURING_BAND_FLOOR: f64 = 0.8;
/// Coefficient of variation under which structuring amounts count as uniform.
const STRUCTURING_UNIFORM_CV: f64 = 0.1;
/// Maximum delay between one hop and the next in a rapid-movement chain.
const HOP_WINDOW_SECS: i64 = 3600;
const MAX_CHAIN_DEPTH: usize = 10;
/// Longest look-back a rule may configure: ten years.
const MAX_WINDOW_SECS: i64 = 10 * 366 * 86_400;
const MAX_UTC_OFFSET_HOURS: i32 = 14;
const ROUND_EPSILON: f64 = 1e-6;

// ── Parameters ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VelocityParams {
    /// Seconds.
    #[serde(alias = "time_window")]
    pub time_window: i64,
    #[serde(default, alias = "max_transactions")]
    pub max_transactions: Option<u32>,
    #[serde(default, alias = "max_amount")]
    pub max_amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmountParams {
    #[serde(default, alias = "min_amount")]
    pub min_amount: Option<f64>,
    #[serde(default, alias = "max_amount")]
    pub max_amount: Option<f64>,
    /// Relative deviation from the profile average, e.g. 5.0 = 500%.
    #[serde(default, alias = "deviation_threshold")]
    pub deviation_threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuringParams {
    pub amount_threshold: f64,
    /// Seconds.
    pub time_window: i64,
    pub min_transactions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RapidMovementParams {
    /// Seconds.
    pub time_window: i64,
    pub min_hops: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundAmountParams {
    #[serde(default = "default_precision")]
    pub precision: f64,
    #[serde(default = "default_round_floor")]
    pub min_amount: f64,
}

fn default_precision() -> f64 {
    100.0
}

fn default_round_floor() -> f64 {
    1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternSpec {
    Structuring(StructuringParams),
    RapidMovement(RapidMovementParams),
    RoundAmount(RoundAmountParams),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternParams {
    pub patterns: Vec<PatternSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DormantParams {
    #[serde(default = "default_dormancy_days")]
    pub dormancy_days: f64,
    /// Reactivations at or below this amount are ignored.
    #[serde(default)]
    pub min_amount: f64,
}

fn default_dormancy_days() -> f64 {
    90.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnusualTimeParams {
    #[serde(default)]
    pub unusual_hours: Vec<u32>,
    /// Local time = UTC + offset.
    #[serde(default)]
    pub utc_offset_hours: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BehaviorSpec {
    NewCounterparty,
    DormantAccount(DormantParams),
    UnusualTime(UnusualTimeParams),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorParams {
    pub behaviors: Vec<BehaviorSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateField {
    #[serde(alias = "SUM(amount)")]
    SumAmount,
    #[serde(alias = "COUNT(*)")]
    Count,
    #[serde(alias = "AVG(amount)")]
    AvgAmount,
    #[serde(alias = "MAX(amount)")]
    MaxAmount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateParams {
    /// Seconds.
    pub aggregation_period: i64,
    pub aggregation_field: AggregateField,
    pub threshold: f64,
}

/// Typed parameters of one monitoring rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleCheck {
    Velocity(VelocityParams),
    Amount(AmountParams),
    Pattern(PatternParams),
    Behavior(BehaviorParams),
    Aggregate(AggregateParams),
    /// Unrecognised family; never triggers.
    Unknown { kind: String, parameters: Value },
}

impl RuleCheck {
    pub fn from_parts(kind: &str, parameters: Value) -> ComplianceResult<Self> {
        let check = match kind {
            "velocity" => Self::Velocity(parse(kind, parameters)?),
            "amount" => Self::Amount(parse(kind, parameters)?),
            "pattern" => Self::Pattern(parse(kind, parameters)?),
            "behavior" => Self::Behavior(parse(kind, parameters)?),
            "aggregate" => Self::Aggregate(parse(kind, parameters)?),
            other => Self::Unknown {
                kind: other.to_string(),
                parameters,
            },
        };
        check.validate()?;
        Ok(check)
    }

    /// Windows within `0..=MAX_WINDOW_SECS`, offsets within a real time zone.
    pub fn validate(&self) -> ComplianceResult<()> {
        match self {
            Self::Velocity(p) => window("timeWindow", p.time_window),
            Self::Pattern(p) => p.patterns.iter().try_for_each(|check| match check {
                PatternSpec::Structuring(s) => window("time_window", s.time_window),
                PatternSpec::RapidMovement(r) => window("time_window", r.time_window),
                PatternSpec::RoundAmount(_) | PatternSpec::Unknown => Ok(()),
            }),
            Self::Behavior(p) => p.behaviors.iter().try_for_each(|check| match check {
                BehaviorSpec::UnusualTime(u) if u.utc_offset_hours.abs() > MAX_UTC_OFFSET_HOURS => {
                    Err(ComplianceError::validation(
                        "utc_offset_hours",
                        format!("{} is outside ±{MAX_UTC_OFFSET_HOURS}", u.utc_offset_hours),
                    ))
                }
                _ => Ok(()),
            }),
            Self::Aggregate(p) => window("aggregation_period", p.aggregation_period),
            Self::Amount(_) | Self::Unknown { .. } => Ok(()),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Velocity(_) => Velocity::NAME,
            Self::Amount(_) => Amount::NAME,
            Self::Pattern(_) => Pattern::NAME,
            Self::Behavior(_) => Behavior::NAME,
            Self::Aggregate(_) => Aggregate::NAME,
            Self::Unknown { kind, .. } => kind,
        }
    }

    pub fn parameters(&self) -> Value {
        let encoded = match self {
            Self::Velocity(p) => serde_json::to_value(p),
            Self::Amount(p) => serde_json::to_value(p),
            Self::Pattern(p) => serde_json::to_value(p),
            Self::Behavior(p) => serde_json::to_value(p),
            Self::Aggregate(p) => serde_json::to_value(p),
            Self::Unknown { parameters, .. } => Ok(parameters.clone()),
        };
        encoded.unwrap_or(Value::Null)
    }
}

fn window(field: &str, secs: i64) -> ComplianceResult<()> {
    if (0..=MAX_WINDOW_SECS).contains(&secs) {
        Ok(())
    } else {
        Err(ComplianceError::validation(
            field,
            format!("{secs}s is outside 0..={MAX_WINDOW_SECS}s"),
        ))
    }
}

fn parse<T: DeserializeOwned>(kind: &str, parameters: Value) -> ComplianceResult<T> {
    serde_json::from_value(parameters)
        .map_err(|e| ComplianceError::validation("parameters", format!("{kind}: {e}")))
}

// ── Evaluation ───────────────────────────────────────────────────────────────

/// Everything a family may look at while judging one transaction.
pub struct EvalContext<'a> {
    pub transaction: &'a Transaction,
    pub profile: &'a UserRiskProfile,
    pub store: &'a dyn MonitoringStore,
}

impl EvalContext<'_> {
    /// The user's earlier transactions in `[timestamp - window, timestamp]`.
    fn history(&self, window_secs: i64) -> ComplianceResult<Vec<Transaction>> {
        let tx = self.transaction;
        let start = Duration::try_seconds(window_secs.max(0))
            .and_then(|window| tx.timestamp.checked_sub_signed(window))
            .ok_or_else(|| {
                ComplianceError::validation("time_window", format!("{window_secs}s is out of range"))
            })?;
        Ok(self
            .store
            .transactions_for_user_since(&tx.user_id, start)?
            .into_iter()
            .filter(|t| t.id != tx.id && t.timestamp <= tx.timestamp)
            .collect())
    }
}

pub trait RuleFamily {
    type Params;
    const NAME: &'static str;

    fn evaluate(params: &Self::Params, ctx: &EvalContext<'_>) -> ComplianceResult<Option<RuleHit>>;
}

pub fn evaluate_check(check: &RuleCheck, ctx: &EvalContext<'_>) -> ComplianceResult<Option<RuleHit>> {
    match check {
        RuleCheck::Velocity(p) => Velocity::evaluate(p, ctx),
        RuleCheck::Amount(p) => Amount::evaluate(p, ctx),
        RuleCheck::Pattern(p) => Pattern::evaluate(p, ctx),
        RuleCheck::Behavior(p) => Behavior::evaluate(p, ctx),
        RuleCheck::Aggregate(p) => Aggregate::evaluate(p, ctx),
        RuleCheck::Unknown { .. } => Ok(None),
    }
}

fn ratio_score(actual: f64, threshold: f64, scale: f64) -> f64 {
    ((actual / threshold) * scale).min(100.0)
}

fn hit(score: f64, reason: String, details: Value) -> Option<RuleHit> {
    Some(RuleHit {
        score,
        reason,
        confidence: None,
        details,
    })
}

pub struct Velocity;

impl RuleFamily for Velocity {
    type Params = VelocityParams;
    const NAME: &'static str = "velocity";

    fn evaluate(p: &VelocityParams, ctx: &EvalContext<'_>) -> ComplianceResult<Option<RuleHit>> {
        let history = ctx.history(p.time_window)?;
        let count = history.len() + 1;
        let total: f64 = history.iter().map(|t| t.amount).sum::<f64>() + ctx.transaction.amount;

        if let Some(max) = p.max_transactions.filter(|m| *m > 0) {
            if count > max as usize {
                return Ok(hit(
                    ratio_score(count as f64, f64::from(max), 50.0),
                    format!("High transaction velocity: {count} transactions in {}s", p.time_window),
                    json!({ "count": count, "time_window": p.time_window, "threshold": max }),
                ));
            }
        }
        if let Some(max) = p.max_amount.filter(|m| *m > 0.0) {
            if total > max {
                return Ok(hit(
                    ratio_score(total, max, 50.0),
                    format!("High transaction volume: {total} in {}s", p.time_window),
                    json!({ "total": total, "time_window": p.time_window, "threshold": max }),
                ));
            }
        }
        Ok(None)
    }
}

pub struct Amount;

impl RuleFamily for Amount {
    type Params = AmountParams;
    const NAME: &'static str = "amount";

    fn evaluate(p: &AmountParams, ctx: &EvalContext<'_>) -> ComplianceResult<Option<RuleHit>> {
        let amount = ctx.transaction.amount;

        if let Some(min) = p.min_amount.filter(|m| *m > 0.0) {
            if amount < min {
                return Ok(hit(
                    BELOW_MINIMUM_SCORE,
                    format!("Transaction amount below threshold: {amount} < {min}"),
                    json!({ "amount": amount, "threshold": min }),
                ));
            }
        }
        if let Some(max) = p.max_amount.filter(|m| *m > 0.0) {
            if amount > max {
                return Ok(hit(
                    ratio_score(amount, max, 60.0),
                    format!("Transaction amount above threshold: {amount} > {max}"),
                    json!({ "amount": amount, "threshold": max }),
                ));
            }
        }

        let average = ctx.profile.average_transaction_amount;
        if let Some(threshold) = p.deviation_threshold {
            if average > 0.0 {
                let deviation = (amount - average).abs() / average;
                if deviation > threshold {
                    return Ok(hit(
                        (deviation * 40.0).min(100.0),
                        format!("Amount deviates {:.0}% from the user's average", deviation * 100.0),
                        json!({ "amount": amount, "average": average, "deviation": deviation }),
                    ));
                }
            }
        }
        Ok(None)
    }
}

pub struct Pattern;

impl RuleFamily for Pattern {
    type Params = PatternParams;
    const NAME: &'static str = "pattern";

    fn evaluate(p: &PatternParams, ctx: &EvalContext<'_>) -> ComplianceResult<Option<RuleHit>> {
        for check in &p.patterns {
            let found = match check {
                PatternSpec::Structuring(s) => structuring(s, ctx)?,
                PatternSpec::RapidMovement(r) => rapid_movement(r, ctx)?,
                PatternSpec::RoundAmount(r) => round_amount(r, ctx.transaction.amount),
                PatternSpec::Unknown => None,
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }
}

fn structuring(p: &StructuringParams, ctx: &EvalContext<'_>) -> ComplianceResult<Option<RuleHit>> {
    let floor = p.amount_threshold * STRUCTURING_BAND_FLOOR;
    let in_band = |amount: f64| amount >= floor && amount < p.amount_threshold;

    let mut amounts: Vec<f64> = ctx
        .history(p.time_window)?
        .iter()
        .map(|t| t.amount)
        .filter(|a| in_band(*a))
        .collect();
    if in_band(ctx.transaction.amount) {
        amounts.push(ctx.transaction.amount);
    }
    if amounts.is_empty() || amounts.len() < p.min_transactions {
        return Ok(None);
    }

    let confidence = structuring_confidence(&amounts);
    Ok(Some(RuleHit {
        score: STRUCTURING_SCORE,
        reason: "Potential structuring detected".into(),
        confidence: Some(confidence),
        details: json!({
            "pattern": "structuring",
            "count": amounts.len(),
            "amounts": amounts,
            "threshold": p.amount_threshold,
        }),
    }))
}

/// 0.9 when the amounts are nearly uniform, else 0.5.
pub fn structuring_confidence(amounts: &[f64]) -> f64 {
    if amounts.is_empty() {
        return 0.0;
    }
    let n = amounts.len() as f64;
    let mean = amounts.iter().sum::<f64>() / n;
    let variance = amounts.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
    if variance.sqrt() < mean * STRUCTURING_UNIFORM_CV {
        0.9
    } else {
        0.5
    }
}

fn rapid_movement(p: &RapidMovementParams, ctx: &EvalContext<'_>) -> ComplianceResult<Option<RuleHit>> {
    let tx = ctx.transaction;
    let mut starts: Vec<Transaction> = ctx
        .history(p.time_window)?
        .into_iter()
        .filter(|t| t.from_account.is_some() && t.to_account.is_some())
        .collect();
    if tx.from_account.is_some() && tx.to_account.is_some() {
        starts.push(tx.clone());
    }

    let mut longest: Vec<String> = Vec::new();
    for start in &starts {
        let chain = longest_chain(ctx.store, start, 1)?;
        if chain.len() > longest.len() {
            longest = chain;
        }
    }

    if p.min_hops == 0 || longest.len() < p.min_hops {
        return Ok(None);
    }
    Ok(hit(
        RAPID_MOVEMENT_SCORE,
        format!("Rapid fund movement across {} hops", longest.len()),
        json!({ "pattern": "rapid_movement", "hops": longest.len(), "transactions": longest }),
    ))
}

/// Ids of the longest chain of onward transfers starting at `hop`.
fn longest_chain(
    store: &dyn MonitoringStore,
    hop: &Transaction,
    depth: usize,
) -> ComplianceResult<Vec<String>> {
    let mut best = Vec::new();
    if depth < MAX_CHAIN_DEPTH {
        if let Some(next_account) = hop.to_account.as_deref() {
            let until = hop
                .timestamp
                .checked_add_signed(Duration::seconds(HOP_WINDOW_SECS))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            for next in store.outbound_transfers(next_account, hop.timestamp, until)? {
                if next.id == hop.id {
                    continue;
                }
                let chain = longest_chain(store, &next, depth + 1)?;
                if chain.len() > best.len() {
                    best = chain;
                }
            }
        }
    }
    best.insert(0, hop.id.clone());
    Ok(best)
}

fn round_amount(p: &RoundAmountParams, amount: f64) -> Option<RuleHit> {
    if !is_round(amount, p.precision) || amount < p.min_amount {
        return None;
    }
    hit(
        ROUND_AMOUNT_SCORE,
        "Round amount transaction".into(),
        json!({ "pattern": "round_amount", "amount": amount, "precision": p.precision }),
    )
}

pub fn is_round(amount: f64, precision: f64) -> bool {
    if !(precision > 0.0) || !amount.is_finite() {
        return false;
    }
    let rem = amount.rem_euclid(precision);
    rem < ROUND_EPSILON || precision - rem < ROUND_EPSILON
}

pub struct Behavior;

impl RuleFamily for Behavior {
    type Params = BehaviorParams;
    const NAME: &'static str = "behavior";

    fn evaluate(p: &BehaviorParams, ctx: &EvalContext<'_>) -> ComplianceResult<Option<RuleHit>> {
        let tx = ctx.transaction;
        for check in &p.behaviors {
            let found = match check {
                BehaviorSpec::NewCounterparty => match tx.to_account.as_deref() {
                    Some(to) if !ctx.profile.knows_counterparty(to) => hit(
                        NEW_COUNTERPARTY_SCORE,
                        "Transaction to new counterparty".into(),
                        json!({
                            "counterparty": to,
                            "known_counterparties": ctx.profile.known_counterparties.len(),
                        }),
                    ),
                    _ => None,
                },
                BehaviorSpec::DormantAccount(d) => dormant(d, ctx)?,
                BehaviorSpec::UnusualTime(u) => {
                    let hour = local_hour(tx.timestamp, u.utc_offset_hours);
                    if u.unusual_hours.contains(&hour) {
                        hit(
                            UNUSUAL_TIME_SCORE,
                            "Transaction at unusual time".into(),
                            json!({ "hour": hour, "timestamp": tx.timestamp }),
                        )
                    } else {
                        None
                    }
                }
                BehaviorSpec::Unknown => None,
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }
}

fn dormant(p: &DormantParams, ctx: &EvalContext<'_>) -> ComplianceResult<Option<RuleHit>> {
    let tx = ctx.transaction;
    let Some(last) = ctx.store.last_activity_before(&tx.user_id, tx.timestamp, &tx.id)? else {
        return Ok(None);
    };
    let days = (tx.timestamp - last).num_seconds() as f64 / 86_400.0;
    if days > p.dormancy_days && tx.amount > p.min_amount {
        return Ok(hit(
            DORMANT_SCORE,
            "Activity on dormant account".into(),
            json!({ "days_dormant": days, "last_activity": last }),
        ));
    }
    Ok(None)
}

pub fn local_hour(at: DateTime<Utc>, utc_offset_hours: i32) -> u32 {
    at.checked_add_signed(Duration::hours(i64::from(utc_offset_hours)))
        .unwrap_or(at)
        .hour()
}

pub struct Aggregate;

impl RuleFamily for Aggregate {
    type Params = AggregateParams;
    const NAME: &'static str = "aggregate";

    fn evaluate(p: &AggregateParams, ctx: &EvalContext<'_>) -> ComplianceResult<Option<RuleHit>> {
        if !(p.threshold > 0.0) {
            return Ok(None);
        }
        let mut amounts: Vec<f64> = ctx
            .history(p.aggregation_period)?
            .iter()
            .map(|t| t.amount)
            .collect();
        amounts.push(ctx.transaction.amount);

        let value = aggregate(p.aggregation_field, &amounts);
        if value > p.threshold {
            return Ok(hit(
                ratio_score(value, p.threshold, 50.0),
                format!("Aggregate threshold exceeded: {:?} = {value}", p.aggregation_field),
                json!({
                    "field": p.aggregation_field,
                    "value": value,
                    "threshold": p.threshold,
                    "period": p.aggregation_period,
                }),
            ));
        }
        Ok(None)
    }
}

fn aggregate(field: AggregateField, amounts: &[f64]) -> f64 {
    match field {
        AggregateField::SumAmount => amounts.iter().sum(),
        AggregateField::Count => amounts.len() as f64,
        AggregateField::AvgAmount if amounts.is_empty() => 0.0,
        AggregateField::AvgAmount => amounts.iter().sum::<f64>() / amounts.len() as f64,
        AggregateField::MaxAmount => amounts.iter().copied().fold(0.0, f64::max),
    }
}
