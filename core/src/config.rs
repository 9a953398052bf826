use crate::{monitoring::MonitoringRule, rules::ComplianceRule};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    pub cache_ttl_secs: u64,
    pub match_threshold: f64,
    pub confirmed_threshold: f64,
    pub name_threshold: f64,
    pub address_threshold: f64,
    pub refresh_interval_secs: u64,
    pub lists_marker_ttl_secs: u64,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            match_threshold: 0.5,
            confirmed_threshold: 0.95,
            name_threshold: 0.7,
            address_threshold: 0.6,
            refresh_interval_secs: 6 * 3600,
            lists_marker_ttl_secs: 3600,
        }
    }
}

impl ScreeningConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn lists_marker_ttl(&self) -> Duration {
        Duration::from_secs(self.lists_marker_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Weight of the newest observation in the profile moving averages.
    pub ema_alpha: f64,
    pub counterparty_cap: usize,
    pub profile_cache_ttl_secs: u64,
    /// Dirty profiles are written once this many updates accumulate.
    pub flush_every: usize,
    pub flush_interval_secs: u64,
    pub correlation_window_secs: i64,
    pub queue_capacity: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.1,
            counterparty_cap: 100,
            profile_cache_ttl_secs: 3600,
            flush_every: 10,
            flush_interval_secs: 60,
            correlation_window_secs: 24 * 3600,
            queue_capacity: 1024,
        }
    }
}

impl MonitoringConfig {
    pub fn profile_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.profile_cache_ttl_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn correlation_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.correlation_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Upper bound on any single store or cache call.
    pub timeout_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

impl IoConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub screening: ScreeningConfig,
    pub monitoring: MonitoringConfig,
    pub io: IoConfig,
}

impl EngineConfig {
    /// Load from a JSON file. Absent fields keep their defaults.
    /// In tests, use `EngineConfig::default()`.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ComplianceRulesFile {
    rules: Vec<ComplianceRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct MonitoringRulesFile {
    rules: Vec<MonitoringRule>,
}

/// Default rule pack seeded into a fresh store.
#[derive(Debug, Clone)]
pub struct RuleCatalog {
    pub compliance_rules: Vec<ComplianceRule>,
    pub monitoring_rules: Vec<MonitoringRule>,
}

impl RuleCatalog {
    /// Load from the data/ directory.
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let rules_path = format!("{data_dir}/compliance_rules.json");
        let rules_content = std::fs::read_to_string(&rules_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {rules_path}: {e}"))?;

        let monitoring_path = format!("{data_dir}/monitoring_rules.json");
        let monitoring_content = std::fs::read_to_string(&monitoring_path)
            .map_err(|e| anyhow::anyhow!("Cannot read {monitoring_path}: {e}"))?;

        Self::parse(&rules_content, &monitoring_content)
    }

    /// The same pack, embedded at compile time.
    pub fn builtin() -> anyhow::Result<Self> {
        Self::parse(
            include_str!("../../data/compliance_rules.json"),
            include_str!("../../data/monitoring_rules.json"),
        )
    }

    fn parse(rules: &str, monitoring: &str) -> anyhow::Result<Self> {
        let rules_file: ComplianceRulesFile = serde_json::from_str(rules)?;
        let monitoring_file: MonitoringRulesFile = serde_json::from_str(monitoring)?;
        Ok(Self {
            compliance_rules: rules_file.rules,
            monitoring_rules: monitoring_file.rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "screening": { "cache_ttl_secs": 60 }, "io": { "timeout_ms": 50 } }"#)
                .unwrap();
        assert_eq!(config.screening.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.screening.confirmed_threshold, 0.95);
        assert_eq!(config.monitoring.flush_every, 10);
        assert_eq!(config.io.timeout(), Duration::from_millis(50));
    }

    #[test]
    fn builtin_catalog_parses() {
        let catalog = RuleCatalog::builtin().unwrap();
        assert!(catalog.compliance_rules.iter().any(|r| r.id == "kyc-verification"));
        assert!(catalog.monitoring_rules.iter().any(|r| r.id == "structuring-detection"));
    }
}
