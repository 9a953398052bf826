//! Outbound events: everything the engine tells the outside world.
//!
//! RULE: Components never call notification or reporting code directly.
//! They publish a `ComplianceEvent` and downstream consumers subscribe.

use crate::{
    error::ComplianceResult,
    monitoring::MonitoringAlert,
    types::{EntityId, Severity, UserId},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Every event published by the engine.
/// Variants are added, never removed or reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComplianceEvent {
    AlertRaised(MonitoringAlert),
    Escalation {
        user_id: UserId,
        reason: String,
        alert_count: usize,
        alert_ids: Vec<EntityId>,
    },
    ReportFiled {
        report_id: EntityId,
        transaction_id: EntityId,
        rule_id: EntityId,
        severity: Severity,
    },
}

impl ComplianceEvent {
    /// Logical channel name, matching the pub/sub topics of the platform.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::AlertRaised(_) => "monitoring:alerts",
            Self::Escalation { .. } => "compliance:escalations",
            Self::ReportFiled { .. } => "compliance:reports:new",
        }
    }
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: ComplianceEvent) -> ComplianceResult<()>;
}

/// In-process fan-out over a bounded broadcast channel.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<ComplianceEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ComplianceEvent> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: ComplianceEvent) -> ComplianceResult<()> {
        let channel = event.channel();
        // No subscribers is not an error: nobody is listening yet.
        if self.sender.send(event).is_err() {
            log::debug!("channel={channel} published with no subscribers");
        }
        Ok(())
    }
}
