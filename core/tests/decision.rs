//! End-to-end decisions over the default rule pack.
//!
//! Tests cover: permit / review / block outcomes from each component,
//! reason reporting, and idempotent seeding.

use compliance_core::{
    cache::MemoryCache,
    clock::ManualClock,
    config::{EngineConfig, RuleCatalog},
    engine::{ComplianceEngine, DecisionOutcome, DecisionRequest},
    event::BroadcastPublisher,
    monitoring::{Transaction, TransactionStatus},
    rules::{RuleContext, RulePatch},
    screening::{EntryType, ListSource, SanctionEntry, SanctionsList, ScreeningRequest, ScreeningStatus},
    store::{SanctionsStore, SqliteStore},
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

struct Setup {
    store: Arc<SqliteStore>,
    engine: ComplianceEngine,
}

async fn setup() -> Setup {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.migrate().unwrap();

    store
        .upsert_list(&SanctionsList {
            id: "ofac-sdn".into(),
            name: "OFAC SDN".into(),
            source: ListSource::Ofac,
            active: true,
            last_updated: noon(),
            entries: vec![],
        })
        .unwrap();
    store
        .insert_entry(
            "ofac-sdn",
            &SanctionEntry {
                id: "ofac-100".into(),
                entry_type: EntryType::Individual,
                names: vec!["Viktor Anatolyevich Bout".into()],
                aliases: vec!["Viktor Butt".into()],
                identifiers: vec![],
                addresses: vec![],
                date_of_birth: Some("1967-01-13".into()),
                place_of_birth: None,
                nationality: vec!["RU".into()],
                programs: vec!["SDGT".into()],
                remarks: None,
                risk_score: 100.0,
            },
        )
        .unwrap();

    let engine = engine_over(store.clone());
    engine.initialize().await.unwrap();
    engine.seed(&RuleCatalog::builtin().unwrap()).await.unwrap();
    Setup { store, engine }
}

fn engine_over(store: Arc<SqliteStore>) -> ComplianceEngine {
    let clock = Arc::new(ManualClock::new(noon()));
    ComplianceEngine::new(
        store,
        Arc::new(MemoryCache::new(clock.clone())),
        Arc::new(BroadcastPublisher::new(64)),
        clock,
        EngineConfig::default(),
    )
}

fn applicant(fields: Value) -> RuleContext {
    RuleContext::new().with("user", fields)
}

fn verified() -> Value {
    json!({ "kyc_status": "verified", "aml_risk_score": 10, "jurisdiction": "France" })
}

fn payment(id: &str, amount: f64) -> Transaction {
    Transaction {
        id: id.into(),
        user_id: "user-1".into(),
        tx_type: "payment".into(),
        amount,
        currency: "USD".into(),
        from_account: Some("acct-user-1".into()),
        to_account: None,
        timestamp: noon(),
        metadata: Value::Null,
        status: None,
        risk_score: None,
    }
}

fn subject(name: &str) -> ScreeningRequest {
    ScreeningRequest {
        name: name.into(),
        ..ScreeningRequest::default()
    }
}

#[tokio::test]
async fn clean_applicant_is_permitted() {
    let s = setup().await;
    let decision = s
        .engine
        .decide(&DecisionRequest {
            context: applicant(verified()),
            screening: Some(subject("Jane Margaret Doe")),
            transaction: Some(payment("t1", 250.37)),
        })
        .await
        .unwrap();

    assert_eq!(decision.outcome, DecisionOutcome::Permit);
    assert!(decision.reasons.is_empty());
    assert_eq!(decision.rule_results.len(), 5);
    assert_eq!(decision.screening.unwrap().status, ScreeningStatus::Clear);
    assert_eq!(decision.monitoring.unwrap().risk_score, 0.0);
    assert_eq!(
        s.store.transaction("t1").unwrap().unwrap().status,
        Some(TransactionStatus::Approved)
    );
    s.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn restricted_jurisdiction_blocks() {
    let s = setup().await;
    let mut user = verified();
    user["jurisdiction"] = json!("Iran");
    let decision = s
        .engine
        .decide(&DecisionRequest {
            context: applicant(user),
            ..DecisionRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::Block);
    assert_eq!(decision.reasons, vec!["rule jurisdiction-restrictions rejected"]);
    assert!(decision.screening.is_none() && decision.monitoring.is_none());
}

#[tokio::test]
async fn unverified_kyc_blocks() {
    let s = setup().await;
    let mut user = verified();
    user["kyc_status"] = json!("pending");
    let decision = s
        .engine
        .decide(&DecisionRequest {
            context: applicant(user),
            ..DecisionRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::Block);
}

#[tokio::test]
async fn absent_kyc_status_does_not_reject() {
    let s = setup().await;
    let decision = s
        .engine
        .decide(&DecisionRequest {
            context: applicant(json!({ "jurisdiction": "France" })),
            ..DecisionRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::Permit);
}

#[tokio::test]
async fn high_aml_score_goes_to_review() {
    let s = setup().await;
    let mut user = verified();
    user["aml_risk_score"] = json!(80);
    let decision = s
        .engine
        .decide(&DecisionRequest {
            context: applicant(user),
            ..DecisionRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::Review);
    assert_eq!(decision.reasons, vec!["rule aml-risk-score requires manual review"]);
}

#[tokio::test]
async fn confirmed_sanctions_match_blocks() {
    let s = setup().await;
    let decision = s
        .engine
        .decide(&DecisionRequest {
            context: applicant(verified()),
            screening: Some(subject("Viktor Butt")),
            transaction: None,
        })
        .await
        .unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::Block);
    assert_eq!(decision.reasons, vec!["confirmed sanctions match on OFAC SDN (ofac-100)"]);
}

#[tokio::test]
async fn potential_sanctions_match_goes_to_review() {
    let s = setup().await;
    let decision = s
        .engine
        .decide(&DecisionRequest {
            context: applicant(verified()),
            screening: Some(subject("Viktor Anatolyevic Bot")),
            transaction: None,
        })
        .await
        .unwrap();
    assert_eq!(decision.screening.as_ref().unwrap().status, ScreeningStatus::PotentialMatch);
    assert_eq!(decision.outcome, DecisionOutcome::Review);
}

#[tokio::test]
async fn large_transaction_goes_to_review() {
    let s = setup().await;
    let decision = s
        .engine
        .decide(&DecisionRequest {
            context: applicant(verified()),
            screening: None,
            transaction: Some(payment("big", 60_000.0)),
        })
        .await
        .unwrap();

    assert_eq!(decision.outcome, DecisionOutcome::Review);
    let monitoring = decision.monitoring.unwrap();
    assert!(monitoring.requires_review && !monitoring.blocked);
    assert_eq!(monitoring.alerts[0].rule_id, "large-amount");
    assert!(decision.reasons[0].starts_with("transaction flagged by monitoring"));
    // The transaction was visible to the rules as well.
    assert!(decision
        .rule_results
        .iter()
        .any(|r| r.rule_id == "transaction-limit-daily" && !r.triggered && r.error.is_none()));
    assert_eq!(
        s.store.transaction("big").unwrap().unwrap().status,
        Some(TransactionStatus::Flagged)
    );
}

#[tokio::test]
async fn block_reasons_lead_review_reasons() {
    let s = setup().await;
    let decision = s
        .engine
        .decide(&DecisionRequest {
            context: applicant(json!({ "kyc_status": "verified", "aml_risk_score": 90, "jurisdiction": "Cuba" })),
            screening: None,
            transaction: Some(payment("t9", 150_000.0)),
        })
        .await
        .unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::Block);
    assert_eq!(decision.reasons[0], "rule jurisdiction-restrictions rejected");
    assert!(decision.reasons.len() >= 3);
}

#[tokio::test]
async fn seeding_twice_adds_nothing() {
    let s = setup().await;
    let catalog = RuleCatalog::builtin().unwrap();
    assert_eq!(s.engine.seed(&catalog).await.unwrap(), 0);
    assert_eq!(s.engine.rules.get_rules(None).len(), catalog.compliance_rules.len());
    assert_eq!(s.engine.monitor.rules().len(), catalog.monitoring_rules.len());
}

#[tokio::test]
async fn reseeding_keeps_rules_an_operator_disabled() {
    let s = setup().await;
    s.engine
        .rules
        .update_rule(
            "kyc-verification",
            RulePatch {
                enabled: Some(false),
                ..RulePatch::default()
            },
        )
        .await
        .unwrap();
    let mut large = s
        .engine
        .monitor
        .rules()
        .into_iter()
        .find(|r| r.id == "large-amount")
        .unwrap();
    large.enabled = false;
    s.engine.monitor.upsert_rule(large).await.unwrap();
    s.engine.shutdown().await.unwrap();

    let restarted = engine_over(s.store.clone());
    restarted.initialize().await.unwrap();
    assert_eq!(restarted.seed(&RuleCatalog::builtin().unwrap()).await.unwrap(), 0);
    assert_eq!(
        restarted.rules.get_rule("kyc-verification").map(|r| r.enabled),
        Some(false)
    );
    assert!(restarted
        .monitor
        .rules()
        .iter()
        .any(|r| r.id == "large-amount" && !r.enabled));

    let mut user = verified();
    user["kyc_status"] = json!("pending");
    let decision = restarted
        .decide(&DecisionRequest {
            context: applicant(user),
            ..DecisionRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::Permit);
    assert!(decision.rule_results.iter().all(|r| r.rule_id != "kyc-verification"));
    restarted.shutdown().await.unwrap();
}
