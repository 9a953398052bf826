//! Typed predicate tree for compliance rules.
//!
//! Evaluation is three-valued. A field that is absent (or null) in the
//! context makes its comparison `Unknown`; `Not(Unknown)` stays `Unknown`
//! and `All`/`Any` follow Kleene logic. A rule whose condition ends up
//! `Unknown` does not fire.

use crate::error::{ComplianceError, ComplianceResult};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::OnceLock;
use thiserror::Error;

// ── Context ──────────────────────────────────────────────────────────────────

/// Read-only bag of user / transaction / jurisdiction fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleContext(Value);

impl Default for RuleContext {
    fn default() -> Self {
        Self(Value::Object(Map::new()))
    }
}

impl RuleContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    /// Set a top-level section, e.g. `with("user", json!({...}))`.
    pub fn with(mut self, section: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.0 {
            map.insert(section.to_string(), value);
        }
        self
    }

    /// Resolve a dotted path. Null counts as absent.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut current = &self.0;
        for part in path.split('.') {
            current = current.as_object()?.get(part)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

// ── Predicate tree ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Contains,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Exists {
        field: String,
    },
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn from_bool(b: bool) -> Self {
        if b {
            Self::True
        } else {
            Self::False
        }
    }

    fn negate(self) -> Self {
        match self {
            Self::True => Self::False,
            Self::False => Self::True,
            Self::Unknown => Self::Unknown,
        }
    }

    pub fn is_true(self) -> bool {
        self == Self::True
    }
}

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("field '{field}': operator {op:?} cannot compare {found}")]
    TypeMismatch {
        field: String,
        op: CompareOp,
        found: &'static str,
    },

    #[error("operator {op:?} needs an array operand")]
    NotAnArray { op: CompareOp },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl Condition {
    pub fn compare(field: &str, op: CompareOp, value: Value) -> Self {
        Self::Compare {
            field: field.to_string(),
            op,
            value,
        }
    }

    pub fn evaluate(&self, ctx: &RuleContext) -> Result<Truth, ConditionError> {
        match self {
            Self::All(children) => {
                let mut unknown = false;
                for child in children {
                    match child.evaluate(ctx)? {
                        Truth::False => return Ok(Truth::False),
                        Truth::Unknown => unknown = true,
                        Truth::True => {}
                    }
                }
                Ok(if unknown { Truth::Unknown } else { Truth::True })
            }
            Self::Any(children) => {
                let mut unknown = false;
                for child in children {
                    match child.evaluate(ctx)? {
                        Truth::True => return Ok(Truth::True),
                        Truth::Unknown => unknown = true,
                        Truth::False => {}
                    }
                }
                Ok(if unknown { Truth::Unknown } else { Truth::False })
            }
            Self::Not(inner) => Ok(inner.evaluate(ctx)?.negate()),
            Self::Exists { field } => Ok(Truth::from_bool(ctx.lookup(field).is_some())),
            Self::Compare { field, op, value } => match ctx.lookup(field) {
                None => Ok(Truth::Unknown),
                Some(actual) => compare(field, *op, actual, value).map(Truth::from_bool),
            },
        }
    }

    /// Static checks run before a rule enters the registry.
    pub fn validate(&self, path: &str) -> ComplianceResult<()> {
        match self {
            Self::All(children) | Self::Any(children) => {
                if children.is_empty() {
                    return Err(ComplianceError::validation(path, "empty condition group"));
                }
                for (i, child) in children.iter().enumerate() {
                    child.validate(&format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            Self::Not(inner) => inner.validate(&format!("{path}.not")),
            Self::Exists { field } => validate_field(path, field),
            Self::Compare { field, op, value } => {
                validate_field(path, field)?;
                match op {
                    CompareOp::In | CompareOp::Nin if !value.is_array() => Err(
                        ComplianceError::validation(format!("{path}.value"), "expected an array"),
                    ),
                    CompareOp::Regex => {
                        let pattern = value.as_str().ok_or_else(|| {
                            ComplianceError::validation(format!("{path}.value"), "expected a pattern string")
                        })?;
                        compiled(pattern).map_err(|e| {
                            ComplianceError::validation(format!("{path}.value"), e.to_string())
                        })?;
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

fn pattern_table() -> &'static DashMap<String, Regex> {
    static PATTERNS: OnceLock<DashMap<String, Regex>> = OnceLock::new();
    PATTERNS.get_or_init(DashMap::new)
}

/// Compiled on first use (rule validation) and reused by every evaluation.
fn compiled(pattern: &str) -> Result<Regex, regex::Error> {
    if let Some(re) = pattern_table().get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)?;
    pattern_table().insert(pattern.to_string(), re.clone());
    Ok(re)
}

fn validate_field(path: &str, field: &str) -> ComplianceResult<()> {
    if field.trim().is_empty() || field.split('.').any(str::is_empty) {
        return Err(ComplianceError::validation(
            format!("{path}.field"),
            format!("malformed field path '{field}'"),
        ));
    }
    Ok(())
}

// ── Comparison ───────────────────────────────────────────────────────────────

fn compare(field: &str, op: CompareOp, actual: &Value, expected: &Value) -> Result<bool, ConditionError> {
    match op {
        CompareOp::Eq => Ok(loose_eq(actual, expected)),
        CompareOp::Neq => Ok(!loose_eq(actual, expected)),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let ordering = order(actual, expected).ok_or(ConditionError::TypeMismatch {
                field: field.to_string(),
                op,
                found: kind(actual),
            })?;
            Ok(match op {
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Gte => ordering != Ordering::Less,
                CompareOp::Lt => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        }
        CompareOp::In | CompareOp::Nin => {
            let options = expected.as_array().ok_or(ConditionError::NotAnArray { op })?;
            let found = options.iter().any(|o| loose_eq(actual, o));
            Ok(if op == CompareOp::In { found } else { !found })
        }
        CompareOp::Contains => match actual {
            Value::String(s) => Ok(s.contains(&display(expected))),
            Value::Array(items) => Ok(items.iter().any(|i| loose_eq(i, expected))),
            other => Err(ConditionError::TypeMismatch {
                field: field.to_string(),
                op,
                found: kind(other),
            }),
        },
        CompareOp::Regex => {
            let pattern = expected.as_str().ok_or(ConditionError::TypeMismatch {
                field: field.to_string(),
                op,
                found: kind(expected),
            })?;
            Ok(compiled(pattern)?.is_match(&display(actual)))
        }
    }
}

/// Numbers compare by value (1 == 1.0); everything else structurally.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RuleContext {
        RuleContext::new()
            .with("user", json!({ "kyc_status": "verified", "aml_risk_score": 72, "jurisdiction": "FR" }))
            .with("transaction", json!({ "amount": 150000.0, "currency": "USD" }))
    }

    #[test]
    fn missing_field_is_unknown_even_when_negated() {
        let cond = Condition::Not(Box::new(Condition::compare(
            "user.accreditation_status",
            CompareOp::Eq,
            json!("verified"),
        )));
        assert_eq!(cond.evaluate(&ctx()).unwrap(), Truth::Unknown);
    }

    #[test]
    fn kleene_groups() {
        let known_false = Condition::compare("user.kyc_status", CompareOp::Eq, json!("pending"));
        let unknown = Condition::compare("user.missing", CompareOp::Eq, json!(1));
        let known_true = Condition::compare("transaction.amount", CompareOp::Gt, json!(100000));

        let all = Condition::All(vec![unknown.clone(), known_false.clone()]);
        assert_eq!(all.evaluate(&ctx()).unwrap(), Truth::False);

        let any = Condition::Any(vec![unknown.clone(), known_true]);
        assert_eq!(any.evaluate(&ctx()).unwrap(), Truth::True);

        let any_unknown = Condition::Any(vec![unknown, known_false]);
        assert_eq!(any_unknown.evaluate(&ctx()).unwrap(), Truth::Unknown);
    }

    #[test]
    fn numeric_and_membership_operators() {
        let c = ctx();
        assert!(Condition::compare("user.aml_risk_score", CompareOp::Gte, json!(70.0))
            .evaluate(&c)
            .unwrap()
            .is_true());
        assert!(Condition::compare("user.jurisdiction", CompareOp::Nin, json!(["KP", "IR", "SY"]))
            .evaluate(&c)
            .unwrap()
            .is_true());
        assert!(Condition::compare("transaction.currency", CompareOp::Regex, json!("^US"))
            .evaluate(&c)
            .unwrap()
            .is_true());
    }

    #[test]
    fn ordering_a_string_against_a_number_is_an_error() {
        let cond = Condition::compare("user.kyc_status", CompareOp::Gt, json!(5));
        assert!(matches!(
            cond.evaluate(&ctx()),
            Err(ConditionError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn validation_names_the_offending_field() {
        let cond = Condition::All(vec![Condition::compare(
            "user.jurisdiction",
            CompareOp::In,
            json!("KP"),
        )]);
        match cond.validate("condition") {
            Err(ComplianceError::Validation { field, .. }) => assert_eq!(field, "condition[0].value"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn condition_json_shape() {
        let raw = json!({ "compare": { "field": "user.kyc_status", "op": "neq", "value": "verified" } });
        let cond: Condition = serde_json::from_value(raw).unwrap();
        assert_eq!(cond, Condition::compare("user.kyc_status", CompareOp::Neq, json!("verified")));
    }

    #[test]
    fn validation_compiles_patterns_for_evaluation() {
        let pattern = "^ref-[0-9]{6}$";
        let cond = Condition::compare("user.reference", CompareOp::Regex, json!(pattern));
        cond.validate("condition").unwrap();
        assert!(pattern_table().contains_key(pattern));

        let ctx = RuleContext::new().with("user", json!({ "reference": "ref-004211" }));
        assert_eq!(cond.evaluate(&ctx).unwrap(), Truth::True);
    }
}
