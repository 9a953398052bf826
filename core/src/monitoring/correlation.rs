//! Cross-alert correlation for one user.

use super::model::{AlertStatus, MonitoringAlert};
use crate::types::EntityId;
use std::collections::BTreeSet;

pub const PATTERN_ALERT_TYPE: &str = "multiple_alert_pattern";
pub const PATTERN_ALERT_SCORE: f64 = 85.0;

const DISTINCT_TYPES_FOR_PATTERN: usize = 3;
const ELEVATED_FOR_ESCALATION: usize = 2;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Correlation {
    /// Distinct alert types seen, excluding the pattern type itself.
    pub distinct_types: Vec<String>,
    pub synthesize_pattern: bool,
    /// High or critical alerts in the window.
    pub elevated: Vec<EntityId>,
}

impl Correlation {
    pub fn escalate(&self) -> bool {
        self.elevated.len() >= ELEVATED_FOR_ESCALATION
    }
}

/// Judge a user's recent alerts. Closed alerts are ignored.
pub fn assess(recent: &[MonitoringAlert]) -> Correlation {
    let open: Vec<&MonitoringAlert> = recent
        .iter()
        .filter(|a| !matches!(a.status, AlertStatus::Resolved | AlertStatus::FalsePositive))
        .collect();

    let distinct: BTreeSet<&str> = open
        .iter()
        .map(|a| a.alert_type.as_str())
        .filter(|t| *t != PATTERN_ALERT_TYPE)
        .collect();
    let pattern_present = open.iter().any(|a| a.alert_type == PATTERN_ALERT_TYPE);

    Correlation {
        synthesize_pattern: distinct.len() >= DISTINCT_TYPES_FOR_PATTERN && !pattern_present,
        distinct_types: distinct.into_iter().map(str::to_string).collect(),
        elevated: open
            .iter()
            .filter(|a| a.severity.is_elevated())
            .map(|a| a.id.clone())
            .collect(),
    }
}
