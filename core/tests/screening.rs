//! Sanctions Screener tests.
//!
//! Tests cover: status classification, exact and fuzzy matching, result
//! caching, custom-list maintenance, auditing, and failing closed when
//! the reference data cannot be read.

use compliance_core::{
    cache::MemoryCache,
    clock::ManualClock,
    config::{IoConfig, ScreeningConfig},
    error::{ComplianceError, ComplianceResult},
    screening::{
        EntryType, Identifier, ListSource, SanctionEntry, SanctionsList, SanctionsScreener,
        ScreeningLogEntry, ScreeningRequest, ScreeningStatus,
    },
    store::{SanctionsStore, SqliteStore},
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

fn entry(id: &str, names: &[&str], entry_type: EntryType) -> SanctionEntry {
    SanctionEntry {
        id: id.into(),
        entry_type,
        names: names.iter().map(|n| n.to_string()).collect(),
        aliases: vec![],
        identifiers: vec![],
        addresses: vec![],
        date_of_birth: None,
        place_of_birth: None,
        nationality: vec![],
        programs: vec!["SDGT".into()],
        remarks: None,
        risk_score: 100.0,
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<SqliteStore>,
    screener: Arc<SanctionsScreener>,
}

async fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new(start()));
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.migrate().unwrap();

    store
        .upsert_list(&SanctionsList {
            id: "ofac-sdn".into(),
            name: "OFAC SDN".into(),
            source: ListSource::Ofac,
            active: true,
            last_updated: start(),
            entries: vec![],
        })
        .unwrap();
    let mut ivan = entry("ofac-1", &["Ivan Petrovich Sidorov"], EntryType::Individual);
    ivan.date_of_birth = Some("1970-01-15".into());
    ivan.nationality = vec!["RU".into()];
    ivan.identifiers = vec![Identifier {
        id_type: "passport".into(),
        value: "AB123456".into(),
    }];
    store.insert_entry("ofac-sdn", &ivan).unwrap();
    store
        .insert_entry("ofac-sdn", &entry("ofac-2", &["Oceanic Star"], EntryType::Vessel))
        .unwrap();
    store
        .insert_entry("ofac-sdn", &entry("ofac-3", &["Global Trade Holdings"], EntryType::Entity))
        .unwrap();

    store
        .upsert_list(&SanctionsList {
            id: "un-retired".into(),
            name: "Retired UN list".into(),
            source: ListSource::Un,
            active: false,
            last_updated: start(),
            entries: vec![],
        })
        .unwrap();
    store
        .insert_entry("un-retired", &entry("un-1", &["Maria Garcia Lopez"], EntryType::Individual))
        .unwrap();

    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let screener = Arc::new(SanctionsScreener::new(
        store.clone(),
        cache,
        clock.clone(),
        ScreeningConfig::default(),
        IoConfig::default(),
    ));
    screener.initialize().await.unwrap();
    Harness { clock, store, screener }
}

fn request(name: &str) -> ScreeningRequest {
    ScreeningRequest {
        name: name.into(),
        ..ScreeningRequest::default()
    }
}

#[tokio::test]
async fn exact_name_is_a_confirmed_match() {
    let h = harness().await;
    let result = h.screener.screen(&request("IVAN petrovich  Sidorov")).await.unwrap();

    assert_eq!(result.status, ScreeningStatus::ConfirmedMatch);
    assert_eq!(result.matches.len(), 1);
    let top = &result.matches[0];
    assert_eq!(top.entry_id, "ofac-1");
    assert_eq!(top.match_score, 1.0);
    assert!(!top.requires_review);
    assert_eq!(top.matched_fields, vec!["name"]);
    assert_eq!(result.lists_checked, vec!["OFAC SDN"]);
    h.screener.shutdown().await.unwrap();
}

#[tokio::test]
async fn near_name_match_needs_review() {
    let h = harness().await;
    let mut req = request("Ivan Petrovic Sidorow");
    req.nationality = Some("RU".into());
    let result = h.screener.screen(&req).await.unwrap();

    assert_eq!(result.status, ScreeningStatus::PotentialMatch);
    let top = &result.matches[0];
    assert!(top.match_score > 0.5 && top.match_score < 0.95, "score {}", top.match_score);
    assert!(top.requires_review);
    assert_eq!(top.matched_fields, vec!["name", "nationality"]);
}

#[tokio::test]
async fn unrelated_and_inactive_subjects_are_clear() {
    let h = harness().await;
    let unrelated = h.screener.screen(&request("Jonathan Appleseed")).await.unwrap();
    assert_eq!(unrelated.status, ScreeningStatus::Clear);
    assert!(unrelated.matches.is_empty());

    // Only present on an inactive list.
    let inactive = h.screener.screen(&request("Maria Garcia Lopez")).await.unwrap();
    assert_eq!(inactive.status, ScreeningStatus::Clear);
}

#[tokio::test]
async fn identifier_match_confirms_despite_a_different_name() {
    let h = harness().await;
    let mut req = request("John Smith");
    req.identifiers = vec![Identifier {
        id_type: "passport".into(),
        value: "AB123456".into(),
    }];
    let result = h.screener.screen(&req).await.unwrap();
    assert_eq!(result.status, ScreeningStatus::ConfirmedMatch);
    assert_eq!(result.matches[0].matched_fields, vec!["identifier:passport"]);
}

#[tokio::test]
async fn entries_only_match_compatible_subject_types() {
    let h = harness().await;

    let person = h.screener.screen(&request("Oceanic Star")).await.unwrap();
    assert_eq!(person.status, ScreeningStatus::Clear);

    let vessel = h
        .screener
        .screen(&ScreeningRequest {
            subject_type: EntryType::Vessel,
            ..request("Oceanic Star")
        })
        .await
        .unwrap();
    assert_eq!(vessel.status, ScreeningStatus::ConfirmedMatch);
    assert_eq!(h.screener.stats().cache_hits, 0);

    // Entity entries apply to every subject type.
    let entity = h.screener.screen(&request("Global Trade Holdings")).await.unwrap();
    assert_eq!(entity.status, ScreeningStatus::ConfirmedMatch);
}

#[tokio::test]
async fn repeat_screen_is_served_from_cache() {
    let h = harness().await;
    let req = request("Ivan Petrovich Sidorov");

    let first = h.screener.screen(&req).await.unwrap();
    let second = h.screener.screen(&req).await.unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    let stats = h.screener.stats();
    assert_eq!(stats.scans, 1);
    assert_eq!(stats.cache_hits, 1);

    // Same identity after normalization hits the same entry.
    h.screener.screen(&request("ivan, petrovich sidorov")).await.unwrap();
    assert_eq!(h.screener.stats().scans, 1);

    // Past the validity window the lists are scanned again.
    h.clock.advance(Duration::seconds(301));
    h.screener.screen(&req).await.unwrap();
    assert_eq!(h.screener.stats().scans, 2);
}

#[tokio::test]
async fn every_call_is_audited() {
    let h = harness().await;
    let req = request("Ivan Petrovich Sidorov");
    h.screener.screen(&req).await.unwrap();
    h.screener.screen(&req).await.unwrap();
    h.screener.screen(&request("Nobody Inparticular")).await.unwrap();
    assert_eq!(h.store.screening_log_count().unwrap(), 3);
}

#[tokio::test]
async fn empty_name_is_a_validation_error() {
    let h = harness().await;
    assert!(matches!(
        h.screener.screen(&request("   ")).await,
        Err(ComplianceError::Validation { ref field, .. }) if field == "name"
    ));
    assert_eq!(h.store.screening_log_count().unwrap(), 0);
}

#[tokio::test]
async fn custom_list_entries_are_screened_and_removable() {
    let h = harness().await;
    let generation = h.screener.stats().generation;

    let added = h
        .screener
        .add_to_custom_list(entry("", &["Viktor Blackwood"], EntryType::Individual), "Internal watchlist")
        .await
        .unwrap();
    assert!(added.id.starts_with("custom-"));
    assert!(h.screener.stats().generation > generation);

    let hit = h.screener.screen(&request("Viktor Blackwood")).await.unwrap();
    assert_eq!(hit.status, ScreeningStatus::ConfirmedMatch);
    assert_eq!(hit.matches[0].entry_id, added.id);
    assert!(hit.lists_checked.contains(&"Internal watchlist".to_string()));

    // A second entry lands on the same custom list.
    let other = h
        .screener
        .add_to_custom_list(entry("", &["Elena Marsh"], EntryType::Individual), "Internal watchlist")
        .await
        .unwrap();
    assert_eq!(h.screener.stats().lists, 2);

    h.screener.remove_from_custom_list(&other.id).await.unwrap();
    assert!(matches!(
        h.screener.remove_from_custom_list(&other.id).await,
        Err(ComplianceError::NotFound { .. })
    ));
    // Official list entries cannot be removed this way.
    assert!(matches!(
        h.screener.remove_from_custom_list("ofac-1").await,
        Err(ComplianceError::NotFound { .. })
    ));

    let after = h.screener.screen(&request("Elena Marsh")).await.unwrap();
    assert_eq!(after.status, ScreeningStatus::Clear);
}

#[tokio::test]
async fn custom_entry_needs_a_name() {
    let h = harness().await;
    let result = h
        .screener
        .add_to_custom_list(entry("", &[" "], EntryType::Individual), "Internal watchlist")
        .await;
    assert!(matches!(result, Err(ComplianceError::Validation { ref field, .. }) if field == "names"));
}

// ── Failing closed ───────────────────────────────────────────────────────────

/// A store whose every call fails, or stalls past the I/O timeout.
struct UnreachableStore {
    stall: Option<std::time::Duration>,
}

impl UnreachableStore {
    fn fail<T>(&self) -> ComplianceResult<T> {
        if let Some(stall) = self.stall {
            std::thread::sleep(stall);
        }
        Err(ComplianceError::Unavailable("sanctions database unreachable".into()))
    }
}

impl SanctionsStore for UnreachableStore {
    fn load_active_lists(&self) -> ComplianceResult<Vec<SanctionsList>> {
        self.fail()
    }
    fn upsert_list(&self, _list: &SanctionsList) -> ComplianceResult<()> {
        self.fail()
    }
    fn ensure_custom_list(&self, _name: &str, _now: DateTime<Utc>) -> ComplianceResult<String> {
        self.fail()
    }
    fn insert_entry(&self, _list_id: &str, _entry: &SanctionEntry) -> ComplianceResult<()> {
        self.fail()
    }
    fn delete_entry(&self, _entry_id: &str) -> ComplianceResult<bool> {
        self.fail()
    }
    fn append_screening_log(&self, _entry: &ScreeningLogEntry) -> ComplianceResult<()> {
        self.fail()
    }
}

fn unreachable_screener(stall: Option<std::time::Duration>, io: IoConfig) -> SanctionsScreener {
    let clock = Arc::new(ManualClock::new(start()));
    SanctionsScreener::new(
        Arc::new(UnreachableStore { stall }),
        Arc::new(MemoryCache::new(clock.clone())),
        clock,
        ScreeningConfig::default(),
        io,
    )
}

#[tokio::test]
async fn unreadable_lists_report_error_not_clear() {
    let screener = unreachable_screener(None, IoConfig::default());
    let result = screener.screen(&request("Ivan Petrovich Sidorov")).await.unwrap();
    assert_eq!(result.status, ScreeningStatus::Error);
    assert!(result.matches.is_empty());
    assert!(result.error.is_some());
}

#[tokio::test]
async fn store_timeout_reports_error_not_clear() {
    let screener = unreachable_screener(
        Some(std::time::Duration::from_millis(300)),
        IoConfig { timeout_ms: 20 },
    );
    let result = screener.screen(&request("Anyone At All")).await.unwrap();
    assert_eq!(result.status, ScreeningStatus::Error);
    assert!(result.error.as_deref().unwrap_or_default().contains("timed out"));
}
