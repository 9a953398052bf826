//! Transaction intake: a bounded queue drained by one worker.
//!
//! RULE: Backpressure is explicit.
//! `submit` waits for queue capacity; `try_submit` refuses when full.
//! `shutdown` closes the queue, drains what was accepted, then flushes
//! every staged profile.

use super::{model::Transaction, TransactionMonitor};
use crate::{
    error::{ComplianceError, ComplianceResult},
    task::BackgroundTask,
};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

pub struct MonitorHandle {
    sender: mpsc::Sender<Transaction>,
    worker: JoinHandle<usize>,
    flusher: BackgroundTask,
    monitor: Arc<TransactionMonitor>,
}

impl TransactionMonitor {
    /// Spawn the intake worker and the periodic profile flush.
    /// Must be called from inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> MonitorHandle {
        let (sender, mut receiver) = mpsc::channel::<Transaction>(self.config.queue_capacity.max(1));

        let monitor = Arc::clone(self);
        let worker = tokio::spawn(async move {
            let mut processed = 0usize;
            while let Some(tx) = receiver.recv().await {
                match monitor.process_transaction(&tx).await {
                    Ok(result) => {
                        processed += 1;
                        log::debug!(
                            "tx={} processed status={:?} alerts={}",
                            tx.id,
                            result.status(),
                            result.alerts.len()
                        );
                    }
                    Err(e) => log::error!("tx={} user={} analysis failed: {e}", tx.id, tx.user_id),
                }
            }
            processed
        });

        let weak = Arc::downgrade(self);
        let flusher = BackgroundTask::periodic("profile-flush", self.config.flush_interval(), move || {
            let weak = weak.clone();
            async move {
                if let Some(monitor) = weak.upgrade() {
                    if let Err(e) = monitor.flush_profiles().await {
                        log::warn!("periodic profile flush failed: {e}");
                    }
                }
            }
        });

        log::info!("transaction intake started capacity={}", self.config.queue_capacity.max(1));
        MonitorHandle {
            sender,
            worker,
            flusher,
            monitor: Arc::clone(self),
        }
    }
}

impl MonitorHandle {
    /// Queue a transaction, waiting while the queue is full.
    pub async fn submit(&self, tx: Transaction) -> ComplianceResult<()> {
        tx.validate()?;
        self.sender
            .send(tx)
            .await
            .map_err(|_| ComplianceError::Unavailable("transaction queue closed".into()))
    }

    /// Queue a transaction only if there is room right now.
    pub fn try_submit(&self, tx: Transaction) -> ComplianceResult<()> {
        tx.validate()?;
        self.sender.try_send(tx).map_err(|e| match e {
            TrySendError::Full(tx) => {
                ComplianceError::Unavailable(format!("transaction queue full, tx={} refused", tx.id))
            }
            TrySendError::Closed(_) => ComplianceError::Unavailable("transaction queue closed".into()),
        })
    }

    pub fn monitor(&self) -> &Arc<TransactionMonitor> {
        &self.monitor
    }

    /// Drain the queue, stop the flush timer and persist staged profiles.
    /// Returns how many transactions the worker processed.
    pub async fn shutdown(self) -> ComplianceResult<usize> {
        let Self {
            sender,
            worker,
            flusher,
            monitor,
        } = self;
        drop(sender);
        let processed = worker
            .await
            .map_err(|e| ComplianceError::Unavailable(format!("intake worker: {e}")))?;
        flusher.stop().await;
        let flushed = monitor.flush_profiles().await?;
        log::info!("transaction intake stopped processed={processed} profiles_flushed={flushed}");
        Ok(processed)
    }
}
