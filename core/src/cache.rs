//! Cache contract and the in-process implementation.
//!
//! Keys used by the engine:
//!   - `sanctions:screening:<sha256>`  screening results (5 minutes)
//!   - `sanctions:lists:loaded`        loaded-lists marker
//!   - `profile:<user_id>`             user risk profiles

use crate::{clock::Clock, error::ComplianceResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub trait ComplianceCache: Send + Sync {
    fn get(&self, key: &str) -> ComplianceResult<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl: Duration) -> ComplianceResult<()>;
    fn delete(&self, key: &str) -> ComplianceResult<()>;
}

struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Concurrent map with per-entry expiry read from the engine clock.
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ComplianceCache for MemoryCache {
    fn get(&self, key: &str) -> ComplianceResult<Option<String>> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> ComplianceResult<()> {
        let ttl = chrono::Duration::from_std(ttl).map_err(anyhow::Error::from)?;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: self.clock.now() + ttl,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> ComplianceResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn entries_expire_with_the_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = MemoryCache::new(clock.clone());

        cache.set("k", "v", Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("v"));

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(cache.is_empty());
    }
}
