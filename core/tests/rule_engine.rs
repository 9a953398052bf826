//! Rule Engine tests.
//!
//! Tests cover: one result per applicable rule, verdict aggregation,
//! priority ordering, missing-field policy, registry mutations and
//! persistence across engines.

use compliance_core::{
    clock::ManualClock,
    config::{IoConfig, RuleCatalog},
    error::ComplianceError,
    rules::{
        CompareOp, ComplianceRule, Condition, RuleAction, RuleContext, RuleEngine, RulePatch,
        RuleType, RuleVerdict,
    },
    store::SqliteStore,
};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

fn store() -> Arc<SqliteStore> {
    let store = SqliteStore::in_memory().expect("open in-memory store");
    store.migrate().expect("migrate");
    Arc::new(store)
}

fn engine_on(store: Arc<SqliteStore>) -> RuleEngine {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()));
    RuleEngine::new(store, clock, IoConfig::default())
}

fn rule(id: &str, rule_type: RuleType, priority: i32, condition: Condition, action: RuleAction) -> ComplianceRule {
    ComplianceRule {
        id: id.into(),
        name: format!("{id} rule"),
        description: String::new(),
        rule_type,
        priority,
        enabled: true,
        condition,
        action,
        metadata: Value::Null,
    }
}

fn user(fields: Value) -> RuleContext {
    RuleContext::new().with("user", fields)
}

async fn engine_with_defaults() -> RuleEngine {
    let engine = engine_on(store());
    for rule in RuleCatalog::builtin().unwrap().compliance_rules {
        engine.add_rule(rule).await.unwrap();
    }
    engine
}

#[tokio::test]
async fn one_result_per_enabled_rule_of_the_requested_type() {
    let engine = engine_with_defaults().await;
    let mut disabled = rule(
        "kyc-disabled",
        RuleType::Kyc,
        10,
        Condition::compare("user.kyc_status", CompareOp::Eq, json!("pending")),
        RuleAction::Reject,
    );
    disabled.enabled = false;
    engine.add_rule(disabled).await.unwrap();

    let ctx = user(json!({ "kyc_status": "verified", "jurisdiction": "France" }));

    let all = engine.evaluate_rules(&ctx, None);
    let enabled = engine.get_rules(None).iter().filter(|r| r.enabled).count();
    assert_eq!(all.len(), enabled);
    assert!(all.iter().all(|r| r.rule_id != "kyc-disabled"));

    let kyc = engine.evaluate_rules(&ctx, Some(RuleType::Kyc));
    assert_eq!(kyc.len(), 1);
    assert_eq!(kyc[0].rule_id, "kyc-verification");
}

#[tokio::test]
async fn overall_pass_iff_every_result_passed() {
    let engine = engine_with_defaults().await;

    let clean = engine.evaluate_rules(
        &user(json!({ "kyc_status": "verified", "aml_risk_score": 10, "jurisdiction": "France" })),
        None,
    );
    let verdict = RuleVerdict::from_results(&clean);
    assert!(verdict.passed);
    assert!(clean.iter().all(|r| r.passed && !r.triggered && r.action.is_none()));

    let restricted = engine.evaluate_rules(
        &user(json!({ "kyc_status": "verified", "aml_risk_score": 10, "jurisdiction": "Iran" })),
        None,
    );
    let verdict = RuleVerdict::from_results(&restricted);
    assert!(!verdict.passed);
    assert!(verdict.rejected);
    assert!(!verdict.requires_review);
    let fired: Vec<&str> = restricted
        .iter()
        .filter(|r| r.triggered)
        .map(|r| r.rule_id.as_str())
        .collect();
    assert_eq!(fired, vec!["jurisdiction-restrictions"]);
}

#[tokio::test]
async fn high_aml_score_asks_for_review() {
    let engine = engine_with_defaults().await;
    let results = engine.evaluate_rules(
        &user(json!({ "kyc_status": "verified", "aml_risk_score": 85 })),
        Some(RuleType::Aml),
    );
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].action, Some(RuleAction::ManualReview));
    assert!(!results[0].passed);
    assert!(RuleVerdict::from_results(&results).requires_review);
}

#[tokio::test]
async fn missing_fields_do_not_fire() {
    let engine = engine_with_defaults().await;
    let results = engine.evaluate_rules(&RuleContext::new(), None);
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| !r.triggered && r.passed && r.error.is_none()));
}

#[tokio::test]
async fn results_follow_priority_then_id() {
    let engine = engine_on(store());
    let always = || Condition::Exists { field: "user.id".into() };
    engine.add_rule(rule("b-low", RuleType::Aml, 1, always(), RuleAction::Allow)).await.unwrap();
    engine.add_rule(rule("a-low", RuleType::Aml, 1, always(), RuleAction::Allow)).await.unwrap();
    engine.add_rule(rule("z-high", RuleType::Kyc, 50, always(), RuleAction::Allow)).await.unwrap();

    let order: Vec<String> = engine
        .evaluate_rules(&user(json!({ "id": "u1" })), None)
        .into_iter()
        .map(|r| r.rule_id)
        .collect();
    assert_eq!(order, vec!["z-high", "a-low", "b-low"]);
}

#[tokio::test]
async fn fired_allow_rule_still_passes() {
    let engine = engine_on(store());
    engine
        .add_rule(rule(
            "whitelist",
            RuleType::Kyc,
            0,
            Condition::compare("user.tier", CompareOp::Eq, json!("gold")),
            RuleAction::Allow,
        ))
        .await
        .unwrap();
    let results = engine.evaluate_rules(&user(json!({ "tier": "gold" })), None);
    assert!(results[0].triggered);
    assert!(results[0].passed);
    assert_eq!(results[0].action, Some(RuleAction::Allow));
}

#[tokio::test]
async fn a_failing_rule_does_not_stop_the_others() {
    let engine = engine_on(store());
    engine
        .add_rule(rule(
            "broken",
            RuleType::Transaction,
            10,
            Condition::compare("user.name", CompareOp::Gt, json!(5)),
            RuleAction::Reject,
        ))
        .await
        .unwrap();
    engine
        .add_rule(rule(
            "jurisdiction",
            RuleType::Jurisdiction,
            5,
            Condition::compare("user.jurisdiction", CompareOp::In, json!(["Cuba"])),
            RuleAction::Reject,
        ))
        .await
        .unwrap();

    let results = engine.evaluate_rules(&user(json!({ "name": "Ann", "jurisdiction": "Cuba" })), None);
    assert_eq!(results.len(), 2);
    let broken = &results[0];
    assert_eq!(broken.rule_id, "broken");
    assert!(!broken.triggered);
    assert!(broken.passed);
    assert!(broken.error.is_some());
    assert!(results[1].triggered);
}

#[tokio::test]
async fn malformed_rules_are_rejected_with_the_field() {
    let engine = engine_on(store());

    let bad_regex = rule(
        "bad-regex",
        RuleType::Aml,
        0,
        Condition::compare("user.name", CompareOp::Regex, json!("([a-z")),
        RuleAction::Reject,
    );
    match engine.add_rule(bad_regex).await {
        Err(ComplianceError::Validation { field, .. }) => assert_eq!(field, "condition.value"),
        other => panic!("expected a validation error, got {other:?}"),
    }

    let not_array = rule(
        "bad-in",
        RuleType::Aml,
        0,
        Condition::All(vec![Condition::compare("user.country", CompareOp::In, json!("Cuba"))]),
        RuleAction::Reject,
    );
    match engine.add_rule(not_array).await {
        Err(ComplianceError::Validation { field, .. }) => assert_eq!(field, "condition[0].value"),
        other => panic!("expected a validation error, got {other:?}"),
    }

    let mut unnamed = rule("unnamed", RuleType::Aml, 0, Condition::Exists { field: "user.id".into() }, RuleAction::Allow);
    unnamed.name = "  ".into();
    assert!(matches!(
        engine.add_rule(unnamed).await,
        Err(ComplianceError::Validation { ref field, .. }) if field == "name"
    ));
    assert!(engine.get_rules(None).is_empty());
}

#[tokio::test]
async fn mutations_publish_new_generations_and_persist() {
    let store = store();
    let engine = engine_on(store.clone());
    let start = engine.generation();

    let kyc = rule(
        "kyc",
        RuleType::Kyc,
        10,
        Condition::compare("user.kyc_status", CompareOp::Neq, json!("verified")),
        RuleAction::Reject,
    );
    engine.add_rule(kyc.clone()).await.unwrap();
    assert!(engine.generation() > start);

    assert!(matches!(
        engine.add_rule(kyc).await,
        Err(ComplianceError::Validation { ref field, .. }) if field == "id"
    ));

    let updated = engine
        .update_rule(
            "kyc",
            RulePatch {
                action: Some(RuleAction::ManualReview),
                ..RulePatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.action, RuleAction::ManualReview);
    assert_eq!(updated.priority, 10);

    let results = engine.evaluate_rules(&user(json!({ "kyc_status": "pending" })), None);
    assert_eq!(results[0].action, Some(RuleAction::ManualReview));

    // A fresh engine over the same store sees the update.
    let reloaded = engine_on(store.clone());
    assert_eq!(reloaded.load_rules().await.unwrap(), 1);
    assert_eq!(reloaded.get_rule("kyc").unwrap().action, RuleAction::ManualReview);

    assert!(matches!(
        engine.update_rule("missing", RulePatch::default()).await,
        Err(ComplianceError::NotFound { .. })
    ));

    engine.remove_rule("kyc").await.unwrap();
    assert!(engine.get_rule("kyc").is_none());
    assert!(matches!(
        engine.remove_rule("kyc").await,
        Err(ComplianceError::NotFound { .. })
    ));
    assert_eq!(engine_on(store).load_rules().await.unwrap(), 0);
}

#[tokio::test]
async fn accreditation_only_applies_when_the_asset_requires_it() {
    let engine = engine_with_defaults().await;
    let base = json!({ "kyc_status": "verified", "accreditation_status": "none" });

    let plain = RuleContext::new()
        .with("user", base.clone())
        .with("transaction", json!({ "amount": 500 }));
    assert!(RuleVerdict::from_results(&engine.evaluate_rules(&plain, Some(RuleType::Accreditation))).passed);

    let restricted = RuleContext::new()
        .with("user", base)
        .with("transaction", json!({ "amount": 500, "requires_accreditation": true }));
    let verdict = RuleVerdict::from_results(&engine.evaluate_rules(&restricted, Some(RuleType::Accreditation)));
    assert!(verdict.rejected);
}
