//! Per-user rolling risk profiles.
//!
//! RULE: One analysis per user at a time.
//! `ProfileBook::lease` hands out an async per-user lock that is held for
//! the whole read-modify-write of a profile.
//!
//! RULE: Persistence is deterministic.
//! Updated profiles sit in a dirty table (and the cache) until a flush:
//! every `flush_every` updates, on the periodic timer, and on shutdown.

use super::model::Transaction;
use crate::{
    cache::ComplianceCache,
    clock::Clock,
    config::{IoConfig, MonitoringConfig},
    error::ComplianceResult,
    store::{bounded, MonitoringStore},
    types::{clamp_risk, UserId},
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// History window used to bootstrap a profile that was never stored.
const BOOTSTRAP_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 60.0 {
            Self::High
        } else if score >= 30.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRiskProfile {
    pub user_id: UserId,
    pub average_transaction_amount: f64,
    /// Transactions per active day since first seen.
    pub typical_transaction_frequency: f64,
    /// Oldest first.
    #[serde(alias = "common_counterparties")]
    pub known_counterparties: VecDeque<String>,
    pub risk_profile: RiskLevel,
    /// Moving average of composite scores.
    pub risk_score: f64,
    pub transaction_count: u64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl UserRiskProfile {
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            average_transaction_amount: 0.0,
            typical_transaction_frequency: 0.0,
            known_counterparties: VecDeque::new(),
            risk_profile: RiskLevel::Low,
            risk_score: 0.0,
            transaction_count: 0,
            first_seen: None,
            last_activity: None,
            last_updated: now,
        }
    }

    /// Rebuild a profile from stored transactions (oldest first).
    pub fn from_history(user_id: &str, history: &[Transaction], cfg: &MonitoringConfig, now: DateTime<Utc>) -> Self {
        let mut profile = Self::new(user_id, now);
        if history.is_empty() {
            return profile;
        }
        let n = history.len() as f64;
        profile.average_transaction_amount = history.iter().map(|t| t.amount).sum::<f64>() / n;
        for tx in history {
            if let Some(to) = tx.to_account.as_deref() {
                profile.remember_counterparty(to, cfg.counterparty_cap);
            }
        }
        let active_days: HashSet<_> = history.iter().map(|t| t.timestamp.date_naive()).collect();
        profile.typical_transaction_frequency = n / active_days.len().max(1) as f64;
        profile.transaction_count = history.len() as u64;
        profile.first_seen = history.first().map(|t| t.timestamp);
        profile.last_activity = history.last().map(|t| t.timestamp);
        profile
    }

    pub fn knows_counterparty(&self, account: &str) -> bool {
        self.known_counterparties.iter().any(|c| c == account)
    }

    fn remember_counterparty(&mut self, account: &str, cap: usize) {
        if self.knows_counterparty(account) {
            return;
        }
        self.known_counterparties.push_back(account.to_string());
        while self.known_counterparties.len() > cap {
            self.known_counterparties.pop_front();
        }
    }

    /// Fold one analyzed transaction into the profile.
    pub fn observe(&mut self, tx: &Transaction, composite_score: f64, cfg: &MonitoringConfig, now: DateTime<Utc>) {
        let alpha = cfg.ema_alpha.clamp(0.0, 1.0);
        if self.transaction_count == 0 {
            self.average_transaction_amount = tx.amount;
            self.risk_score = clamp_risk(composite_score);
        } else {
            self.average_transaction_amount =
                self.average_transaction_amount * (1.0 - alpha) + tx.amount * alpha;
            self.risk_score = clamp_risk(self.risk_score * (1.0 - alpha) + composite_score * alpha);
        }
        self.risk_profile = RiskLevel::from_score(self.risk_score);

        if let Some(to) = tx.to_account.as_deref() {
            self.remember_counterparty(to, cfg.counterparty_cap);
        }

        self.transaction_count += 1;
        let first = self.first_seen.map_or(tx.timestamp, |f| f.min(tx.timestamp));
        self.first_seen = Some(first);
        self.last_activity = Some(self.last_activity.map_or(tx.timestamp, |l| l.max(tx.timestamp)));
        let span_days = self
            .last_activity
            .map_or(0, |last| (last - first).num_days())
            .max(0)
            + 1;
        self.typical_transaction_frequency = self.transaction_count as f64 / span_days as f64;
        self.last_updated = now;
    }
}

// ── Profile book ─────────────────────────────────────────────────────────────

/// Exclusive right to update one user's profile. Released on drop.
pub struct UserLease<'a> {
    book: &'a ProfileBook,
    user_id: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.book
            .locks
            .remove_if(&self.user_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct ProfileBook {
    store: Arc<dyn MonitoringStore>,
    cache: Arc<dyn ComplianceCache>,
    clock: Arc<dyn Clock>,
    dirty: DashMap<UserId, UserRiskProfile>,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
    pending: AtomicUsize,
    config: MonitoringConfig,
    io: IoConfig,
}

impl ProfileBook {
    pub fn new(
        store: Arc<dyn MonitoringStore>,
        cache: Arc<dyn ComplianceCache>,
        clock: Arc<dyn Clock>,
        config: MonitoringConfig,
        io: IoConfig,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            dirty: DashMap::new(),
            locks: DashMap::new(),
            pending: AtomicUsize::new(0),
            config,
            io,
        }
    }

    pub async fn lease(&self, user_id: &str) -> UserLease<'_> {
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        UserLease {
            book: self,
            user_id: user_id.to_string(),
            guard: Some(guard),
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Dirty table, then cache, then store, then stored history, then empty.
    /// `exclude_tx` keeps the transaction under analysis out of the history.
    pub async fn load(&self, user_id: &str, exclude_tx: Option<&str>) -> ComplianceResult<UserRiskProfile> {
        if let Some(profile) = self.dirty.get(user_id) {
            return Ok(profile.clone());
        }

        let cache = self.cache.clone();
        let key = cache_key(user_id);
        let cached = bounded("profile.cache_get", self.io.timeout(), move || cache.get(&key)).await?;
        if let Some(raw) = cached {
            match serde_json::from_str::<UserRiskProfile>(&raw) {
                Ok(profile) => return Ok(profile),
                Err(e) => log::warn!("user={user_id} ignoring unreadable cached profile: {e}"),
            }
        }

        let store = self.store.clone();
        let uid = user_id.to_string();
        let since = self.clock.now() - Duration::days(BOOTSTRAP_DAYS);
        let config = self.config.clone();
        let now = self.clock.now();
        let exclude = exclude_tx.map(str::to_string);
        bounded("profile.load", self.io.timeout(), move || {
            if let Some(profile) = store.load_profile(&uid)? {
                return Ok(profile);
            }
            let mut history = store.transactions_for_user_since(&uid, since)?;
            history.retain(|t| Some(&t.id) != exclude.as_ref());
            Ok(UserRiskProfile::from_history(&uid, &history, &config, now))
        })
        .await
    }

    /// Stage an updated profile. Flushes once enough updates accumulate.
    pub async fn record(&self, profile: UserRiskProfile) -> ComplianceResult<()> {
        let user_id = profile.user_id.clone();
        let encoded = serde_json::to_string(&profile)?;
        self.dirty.insert(user_id.clone(), profile);

        let cache = self.cache.clone();
        let key = cache_key(&user_id);
        let ttl = self.config.profile_cache_ttl();
        if let Err(e) = bounded("profile.cache_set", self.io.timeout(), move || {
            cache.set(&key, &encoded, ttl)
        })
        .await
        {
            log::warn!("user={user_id} profile cache write failed: {e}");
        }

        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if pending >= self.config.flush_every.max(1) {
            // The batch stays staged for the next flush.
            if let Err(e) = self.flush().await {
                log::debug!("user={user_id} profile kept staged: {e}");
            }
        }
        Ok(())
    }

    /// Write every dirty profile to the store. Returns how many were written.
    pub async fn flush(&self) -> ComplianceResult<usize> {
        self.pending.store(0, Ordering::SeqCst);
        let users: Vec<UserId> = self.dirty.iter().map(|e| e.key().clone()).collect();
        let batch: Vec<UserRiskProfile> = users
            .iter()
            .filter_map(|u| self.dirty.remove(u).map(|(_, p)| p))
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let store = self.store.clone();
        let to_save = batch.clone();
        let saved = bounded("profile.flush", self.io.timeout(), move || {
            for profile in &to_save {
                store.save_profile(profile)?;
            }
            Ok(to_save.len())
        })
        .await;

        match saved {
            Ok(count) => {
                log::debug!("profiles flushed count={count}");
                Ok(count)
            }
            Err(e) => {
                // Put back anything not superseded by a newer update.
                for profile in batch {
                    self.dirty.entry(profile.user_id.clone()).or_insert(profile);
                }
                log::warn!("profile flush failed, will retry: {e}");
                Err(e)
            }
        }
    }
}

fn cache_key(user_id: &str) -> String {
    format!("profile:{user_id}")
}
