//! Sanctions Screener: fuzzy identity screening against watchlists.
//!
//! RULE: `error` is never `clear`.
//! Any store or cache failure on the read path (including a timeout)
//! yields a `status: error` result with no matches. Failures on the write
//! path (result cache, audit log) are logged and the result still returns.
//!
//! RULE: Lists are read from one snapshot per call.
//! Refreshes and custom-list edits swap in a complete new generation.

pub mod matching;

use crate::{
    cache::ComplianceCache,
    clock::Clock,
    config::{IoConfig, ScreeningConfig},
    error::{ComplianceError, ComplianceResult},
    snapshot::Registry,
    store::{bounded, SanctionsStore},
    task::BackgroundTask,
    types::EntityId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub const LISTS_LOADED_KEY: &str = "sanctions:lists:loaded";
const RESULT_KEY_PREFIX: &str = "sanctions:screening:";

// ── Data model ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListSource {
    Ofac,
    Un,
    Eu,
    Uk,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    #[default]
    Individual,
    Entity,
    Vessel,
    Aircraft,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub id_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanctionEntry {
    #[serde(default)]
    pub id: EntityId,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub names: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub place_of_birth: Option<String>,
    #[serde(default)]
    pub nationality: Vec<String>,
    #[serde(default)]
    pub programs: Vec<String>,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(default = "full_risk")]
    pub risk_score: f64,
}

fn full_risk() -> f64 {
    100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanctionsList {
    pub id: EntityId,
    pub name: String,
    pub source: ListSource,
    pub active: bool,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<SanctionEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningRequest {
    pub request_id: Option<String>,
    pub subject_type: EntryType,
    pub name: String,
    pub alternate_names: Vec<String>,
    pub date_of_birth: Option<String>,
    pub nationality: Option<String>,
    pub address: Option<String>,
    pub identifiers: Vec<Identifier>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreeningStatus {
    Clear,
    PotentialMatch,
    ConfirmedMatch,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningMatch {
    pub list_id: EntityId,
    pub list_name: String,
    pub entry_id: EntityId,
    pub match_score: f64,
    pub matched_fields: Vec<String>,
    pub entry: SanctionEntry,
    pub requires_review: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningResult {
    pub request_id: String,
    pub status: ScreeningStatus,
    /// Best first.
    pub matches: Vec<ScreeningMatch>,
    pub lists_checked: Vec<String>,
    pub screening_time_ms: u64,
    pub screened_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningLogEntry {
    pub id: EntityId,
    pub request: ScreeningRequest,
    pub result: ScreeningResult,
    pub cache_hit: bool,
    pub duration_ms: u64,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenerStats {
    pub scans: u64,
    pub cache_hits: u64,
    pub lists: usize,
    pub entries: usize,
    pub generation: u64,
}

/// `clear` without matches, `confirmed_match` once any match reaches the
/// confirmed threshold, `potential_match` otherwise.
pub fn determine_status(matches: &[ScreeningMatch], confirmed_threshold: f64) -> ScreeningStatus {
    if matches.is_empty() {
        ScreeningStatus::Clear
    } else if matches.iter().any(|m| m.match_score >= confirmed_threshold) {
        ScreeningStatus::ConfirmedMatch
    } else {
        ScreeningStatus::PotentialMatch
    }
}

/// SHA-256 over every request field that scoring reads: subject type,
/// normalized names, date of birth, nationality, address and identifiers.
pub fn cache_key(request: &ScreeningRequest) -> String {
    let mut hasher = Sha256::new();
    let mut field = |value: &str| {
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    };
    field(match request.subject_type {
        EntryType::Individual => "individual",
        EntryType::Entity => "entity",
        EntryType::Vessel => "vessel",
        EntryType::Aircraft => "aircraft",
    });
    field(matching::normalize(&request.name).as_str());
    field(request.date_of_birth.as_deref().unwrap_or("").trim());
    field(request.nationality.as_deref().unwrap_or("").trim().to_lowercase().as_str());
    field(matching::normalize(request.address.as_deref().unwrap_or("")).as_str());
    // List sections are delimited.
    field("\u{1}");
    for alt in &request.alternate_names {
        field(matching::normalize(alt).as_str());
    }
    field("\u{1}");
    for id in &request.identifiers {
        field(id.id_type.as_str());
        field(id.value.trim());
    }
    hex::encode(hasher.finalize())
}

// ── Screener ─────────────────────────────────────────────────────────────────

pub struct SanctionsScreener {
    store: Arc<dyn SanctionsStore>,
    cache: Arc<dyn ComplianceCache>,
    clock: Arc<dyn Clock>,
    lists: Registry<Vec<SanctionsList>>,
    writer: tokio::sync::Mutex<()>,
    refresher: Mutex<Option<BackgroundTask>>,
    scans: AtomicU64,
    cache_hits: AtomicU64,
    config: ScreeningConfig,
    io: IoConfig,
}

impl SanctionsScreener {
    pub fn new(
        store: Arc<dyn SanctionsStore>,
        cache: Arc<dyn ComplianceCache>,
        clock: Arc<dyn Clock>,
        config: ScreeningConfig,
        io: IoConfig,
    ) -> Self {
        let lists = Registry::new(Vec::new(), clock.now());
        Self {
            store,
            cache,
            clock,
            lists,
            writer: tokio::sync::Mutex::new(()),
            refresher: Mutex::new(None),
            scans: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            config,
            io,
        }
    }

    /// Load the active lists and start the periodic refresh.
    pub async fn initialize(self: &Arc<Self>) -> ComplianceResult<()> {
        self.refresh().await?;

        let weak = Arc::downgrade(self);
        let task = BackgroundTask::periodic("sanctions-refresh", self.config.refresh_interval(), move || {
            let weak = weak.clone();
            async move {
                if let Some(screener) = weak.upgrade() {
                    if let Err(e) = screener.refresh().await {
                        log::warn!("sanctions refresh failed, keeping previous lists: {e}");
                    }
                }
            }
        });

        let previous = self.lock_refresher()?.replace(task);
        if let Some(previous) = previous {
            previous.stop().await;
        }
        Ok(())
    }

    /// Stop the refresh task, waiting for a running refresh to finish.
    pub async fn shutdown(&self) -> ComplianceResult<()> {
        let task = self.lock_refresher()?.take();
        if let Some(task) = task {
            task.stop().await;
        }
        Ok(())
    }

    /// Reload every active list from the store and swap it in.
    pub async fn refresh(&self) -> ComplianceResult<u64> {
        let _guard = self.writer.lock().await;
        let store = self.store.clone();
        let lists = bounded("sanctions.load_lists", self.io.timeout(), move || {
            store.load_active_lists()
        })
        .await?;

        let entry_count: usize = lists.iter().map(|l| l.entries.len()).sum();
        let list_count = lists.len();
        let generation = self.lists.replace(lists, self.clock.now());
        log::info!("sanctions lists loaded lists={list_count} entries={entry_count} generation={generation}");

        self.write_cache(LISTS_LOADED_KEY, self.clock.now().to_rfc3339(), self.config.lists_marker_ttl())
            .await;
        Ok(generation)
    }

    pub fn stats(&self) -> ScreenerStats {
        let snapshot = self.lists.load();
        ScreenerStats {
            scans: self.scans.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            lists: snapshot.data.len(),
            entries: snapshot.data.iter().map(|l| l.entries.len()).sum(),
            generation: snapshot.generation,
        }
    }

    /// Screen one subject. Only a malformed request is an `Err`; every
    /// other failure is reported as `ScreeningStatus::Error`.
    pub async fn screen(&self, request: &ScreeningRequest) -> ComplianceResult<ScreeningResult> {
        if request.name.trim().is_empty() {
            return Err(ComplianceError::validation("name", "must not be empty"));
        }
        let started = Instant::now();

        let (result, cache_hit) = match self.screen_inner(request, started).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("screening failed, reporting error status: {e}");
                (self.error_result(request, started, &e), false)
            }
        };

        self.audit(request, &result, cache_hit, started).await;
        Ok(result)
    }

    async fn screen_inner(
        &self,
        request: &ScreeningRequest,
        started: Instant,
    ) -> ComplianceResult<(ScreeningResult, bool)> {
        let key = format!("{RESULT_KEY_PREFIX}{}", cache_key(request));

        if let Some(cached) = self.cached_result(&key).await? {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((cached, true));
        }

        self.ensure_lists_loaded().await?;

        self.scans.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.lists.load();
        let subjects = matching::subject_names(request);

        let mut lists_checked = Vec::new();
        let mut matches = Vec::new();
        for list in snapshot.data.iter().filter(|l| l.active) {
            lists_checked.push(list.name.clone());
            for entry in &list.entries {
                if !matching::type_compatible(request.subject_type, entry.entry_type) {
                    continue;
                }
                let scored = matching::score_entry(&subjects, request, entry, &self.config);
                if scored.score > self.config.match_threshold {
                    matches.push(ScreeningMatch {
                        list_id: list.id.clone(),
                        list_name: list.name.clone(),
                        entry_id: entry.id.clone(),
                        match_score: scored.score,
                        matched_fields: scored.matched_fields,
                        entry: entry.clone(),
                        requires_review: scored.score < self.config.confirmed_threshold,
                    });
                }
            }
        }
        matches.sort_by(|a, b| {
            b.match_score
                .total_cmp(&a.match_score)
                .then_with(|| a.entry_id.cmp(&b.entry_id))
        });

        let status = determine_status(&matches, self.config.confirmed_threshold);
        if status == ScreeningStatus::ConfirmedMatch {
            log::warn!(
                "request={} confirmed sanctions match entry={}",
                request.request_id.as_deref().unwrap_or("-"),
                matches.first().map_or("-", |m| m.entry_id.as_str())
            );
        }

        let result = ScreeningResult {
            request_id: self.request_id(request),
            status,
            matches,
            lists_checked,
            screening_time_ms: elapsed_ms(started),
            screened_at: self.clock.now(),
            error: None,
        };

        match serde_json::to_string(&result) {
            Ok(encoded) => self.write_cache(&key, encoded, self.config.cache_ttl()).await,
            Err(e) => log::warn!("screening result not cached: {e}"),
        }
        Ok((result, false))
    }

    /// A cached result still inside its validity window.
    async fn cached_result(&self, key: &str) -> ComplianceResult<Option<ScreeningResult>> {
        let cache = self.cache.clone();
        let owned = key.to_string();
        let Some(raw) = bounded("sanctions.cache_get", self.io.timeout(), move || cache.get(&owned)).await? else {
            return Ok(None);
        };
        let cached: ScreeningResult = match serde_json::from_str(&raw) {
            Ok(cached) => cached,
            Err(e) => {
                log::warn!("ignoring unreadable cached screening result: {e}");
                return Ok(None);
            }
        };
        let age = self.clock.now() - cached.screened_at;
        let ttl = chrono::Duration::from_std(self.config.cache_ttl()).map_err(anyhow::Error::from)?;
        Ok((age < ttl).then_some(cached))
    }

    async fn ensure_lists_loaded(&self) -> ComplianceResult<()> {
        let cache = self.cache.clone();
        let marker = bounded("sanctions.cache_get", self.io.timeout(), move || {
            cache.get(LISTS_LOADED_KEY)
        })
        .await?;
        if marker.is_none() {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Add an entry to the custom list `list_name`, creating the list if needed.
    /// Returns the stored entry with its assigned id.
    pub async fn add_to_custom_list(
        &self,
        mut entry: SanctionEntry,
        list_name: &str,
    ) -> ComplianceResult<SanctionEntry> {
        if list_name.trim().is_empty() {
            return Err(ComplianceError::validation("list_name", "must not be empty"));
        }
        if entry.names.iter().all(|n| n.trim().is_empty()) {
            return Err(ComplianceError::validation("names", "at least one name is required"));
        }

        let _guard = self.writer.lock().await;
        let now = self.clock.now();
        let store = self.store.clone();
        let name = list_name.to_string();
        let list_id = bounded("sanctions.ensure_list", self.io.timeout(), move || {
            store.ensure_custom_list(&name, now)
        })
        .await?;

        entry.id = format!("{list_id}-{}", uuid::Uuid::new_v4());
        let store = self.store.clone();
        let (id_for_store, stored) = (list_id.clone(), entry.clone());
        bounded("sanctions.insert_entry", self.io.timeout(), move || {
            store.insert_entry(&id_for_store, &stored)
        })
        .await?;

        self.lists.update(now, |lists| {
            match lists.iter_mut().find(|l| l.id == list_id) {
                Some(list) => {
                    list.entries.push(entry.clone());
                    list.last_updated = now;
                }
                None => lists.push(SanctionsList {
                    id: list_id.clone(),
                    name: list_name.to_string(),
                    source: ListSource::Custom,
                    active: true,
                    last_updated: now,
                    entries: vec![entry.clone()],
                }),
            }
        });
        self.invalidate_lists_marker().await;
        log::info!("entry={} added to custom list={list_name}", entry.id);
        Ok(entry)
    }

    pub async fn remove_from_custom_list(&self, entry_id: &str) -> ComplianceResult<()> {
        let _guard = self.writer.lock().await;
        let store = self.store.clone();
        let id = entry_id.to_string();
        let removed = bounded("sanctions.delete_entry", self.io.timeout(), move || {
            store.delete_entry(&id)
        })
        .await?;
        if !removed {
            return Err(ComplianceError::not_found("custom list entry", entry_id));
        }

        self.lists.update(self.clock.now(), |lists| {
            for list in lists.iter_mut().filter(|l| l.source == ListSource::Custom) {
                list.entries.retain(|e| e.id != entry_id);
            }
        });
        self.invalidate_lists_marker().await;
        log::info!("entry={entry_id} removed from custom lists");
        Ok(())
    }

    async fn invalidate_lists_marker(&self) {
        let cache = self.cache.clone();
        if let Err(e) = bounded("sanctions.cache_delete", self.io.timeout(), move || {
            cache.delete(LISTS_LOADED_KEY)
        })
        .await
        {
            log::warn!("lists marker not invalidated: {e}");
        }
    }

    async fn write_cache(&self, key: &str, value: String, ttl: std::time::Duration) {
        let cache = self.cache.clone();
        let owned = key.to_string();
        if let Err(e) = bounded("sanctions.cache_set", self.io.timeout(), move || {
            cache.set(&owned, &value, ttl)
        })
        .await
        {
            log::warn!("key={key} cache write failed: {e}");
        }
    }

    async fn audit(&self, request: &ScreeningRequest, result: &ScreeningResult, cache_hit: bool, started: Instant) {
        let entry = ScreeningLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            request: request.clone(),
            result: result.clone(),
            cache_hit,
            duration_ms: elapsed_ms(started),
            logged_at: self.clock.now(),
        };
        let store = self.store.clone();
        if let Err(e) = bounded("sanctions.audit", self.io.timeout(), move || {
            store.append_screening_log(&entry)
        })
        .await
        {
            log::warn!("screening audit log write failed: {e}");
        }
    }

    fn error_result(&self, request: &ScreeningRequest, started: Instant, error: &ComplianceError) -> ScreeningResult {
        ScreeningResult {
            request_id: self.request_id(request),
            status: ScreeningStatus::Error,
            matches: Vec::new(),
            lists_checked: Vec::new(),
            screening_time_ms: elapsed_ms(started),
            screened_at: self.clock.now(),
            error: Some(error.to_string()),
        }
    }

    fn request_id(&self, request: &ScreeningRequest) -> String {
        request
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    fn lock_refresher(&self) -> ComplianceResult<std::sync::MutexGuard<'_, Option<BackgroundTask>>> {
        self.refresher
            .lock()
            .map_err(|_| ComplianceError::Unavailable("refresh task lock poisoned".into()))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(score: f64) -> ScreeningMatch {
        ScreeningMatch {
            list_id: "l".into(),
            list_name: "L".into(),
            entry_id: "e".into(),
            match_score: score,
            matched_fields: vec!["name".into()],
            entry: SanctionEntry {
                id: "e".into(),
                entry_type: EntryType::Individual,
                names: vec!["x".into()],
                aliases: vec![],
                identifiers: vec![],
                addresses: vec![],
                date_of_birth: None,
                place_of_birth: None,
                nationality: vec![],
                programs: vec![],
                remarks: None,
                risk_score: 100.0,
            },
            requires_review: score < 0.95,
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(determine_status(&[], 0.95), ScreeningStatus::Clear);
        assert_eq!(
            determine_status(&[matched(0.6), matched(0.95)], 0.95),
            ScreeningStatus::ConfirmedMatch
        );
        assert_eq!(
            determine_status(&[matched(0.6), matched(0.94)], 0.95),
            ScreeningStatus::PotentialMatch
        );
    }

    #[test]
    fn cache_key_ignores_case_and_punctuation() {
        let a = ScreeningRequest {
            name: "John  O'Neil".into(),
            date_of_birth: Some("1980-02-03".into()),
            ..ScreeningRequest::default()
        };
        let b = ScreeningRequest {
            name: "JOHN O NEIL".into(),
            date_of_birth: Some("1980-02-03".into()),
            ..ScreeningRequest::default()
        };
        assert_eq!(cache_key(&a), cache_key(&b));
        assert_eq!(cache_key(&a).len(), 64);
    }

    #[test]
    fn cache_key_separates_every_scored_field() {
        let base = ScreeningRequest {
            name: "Oceanic Star".into(),
            ..ScreeningRequest::default()
        };
        let variants = [
            ScreeningRequest { subject_type: EntryType::Vessel, ..base.clone() },
            ScreeningRequest { address: Some("1 Harbour Road".into()), ..base.clone() },
            ScreeningRequest { alternate_names: vec!["Ocean Star".into()], ..base.clone() },
            ScreeningRequest {
                identifiers: vec![Identifier { id_type: "IMO".into(), value: "9123456".into() }],
                ..base.clone()
            },
        ];
        let key = cache_key(&base);
        for variant in &variants {
            assert_ne!(cache_key(variant), key, "{variant:?}");
        }
    }
}
