//! # Maintenance Worker
//!
//! Periodic housekeeping for the engine.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Maintenance Loop                                 │
//! │                                                                         │
//! │  every interval_seconds (30 s)                                          │
//! │    1. coordinator.process_retry_queue()     retry:{target}:*           │
//! │    2. writer.retry_failed_operations()      retry:transaction:*        │
//! │    3. backlog check                         warn above thresholds      │
//! │                                                                         │
//! │  every cleanup_interval_seconds (300 s)                                 │
//! │    4. writer.cleanup_expired_transactions()                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MaintenanceSettings;
use crate::coordinator::ConsistencyCoordinator;
use crate::dead_letter::DeadLetterQueue;
use crate::error::{SyncError, SyncResult};
use crate::retry::RetryReport;
use crate::writer::TransactionalWriter;

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub sync_retries: RetryReport,
    pub operation_retries: RetryReport,
    pub pending_sync_retries: usize,
    pub pending_operation_retries: usize,
    pub pending_manual_conflicts: usize,
    pub dead_letters: usize,
}

/// Runs the housekeeping loop.
pub struct MaintenanceWorker {
    settings: MaintenanceSettings,
    coordinator: ConsistencyCoordinator,
    writer: TransactionalWriter,
    dead_letters: DeadLetterQueue,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping the worker.
#[derive(Clone)]
pub struct MaintenanceHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl MaintenanceHandle {
    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Maintenance shutdown channel closed".into()))
    }
}

impl MaintenanceWorker {
    pub fn new(
        settings: MaintenanceSettings,
        coordinator: ConsistencyCoordinator,
        writer: TransactionalWriter,
        dead_letters: DeadLetterQueue,
    ) -> (Self, MaintenanceHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = MaintenanceWorker {
            settings,
            coordinator,
            writer,
            dead_letters,
            shutdown_rx,
        };
        (worker, MaintenanceHandle { shutdown_tx })
    }

    /// Runs until the handle signals shutdown.
    ///
    /// This should be spawned as a background task.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.settings.interval_seconds,
            cleanup_interval_secs = self.settings.cleanup_interval_seconds,
            "Maintenance worker starting"
        );

        let mut retry_tick =
            tokio::time::interval(Duration::from_secs(self.settings.interval_seconds.max(1)));
        retry_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cleanup_tick = tokio::time::interval(Duration::from_secs(
            self.settings.cleanup_interval_seconds.max(1),
        ));
        cleanup_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = retry_tick.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error_kind = %e.kind(), ?e, "Maintenance pass failed");
                    }
                }

                _ = cleanup_tick.tick() => {
                    if let Err(e) = self.writer.cleanup_expired_transactions().await {
                        error!(error_kind = %e.kind(), ?e, "Transaction cleanup failed");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Maintenance worker shutting down");
                    break;
                }
            }
        }

        info!("Maintenance worker stopped");
    }

    /// Processes both retry queues and checks backlogs.
    pub async fn run_once(&self) -> SyncResult<MaintenanceReport> {
        let sync_retries = self.coordinator.process_retry_queue().await?;
        let operation_retries = self.writer.retry_failed_operations().await?;
        let report = MaintenanceReport {
            sync_retries,
            operation_retries,
            pending_sync_retries: self.coordinator.retry_queue().len().await?,
            pending_operation_retries: self.writer.retry_queue().len().await?,
            pending_manual_conflicts: self.coordinator.pending_manual_conflicts().await?.len(),
            dead_letters: self.dead_letters.count().await?,
        };

        let retry_backlog = report.pending_sync_retries + report.pending_operation_retries;
        if retry_backlog > self.settings.retry_backlog_warning {
            warn!(
                retry_backlog,
                threshold = self.settings.retry_backlog_warning,
                "Retry backlog above threshold"
            );
        }
        if report.pending_manual_conflicts > self.settings.conflict_backlog_warning {
            warn!(
                pending = report.pending_manual_conflicts,
                threshold = self.settings.conflict_backlog_warning,
                "Manual conflicts waiting for an operator"
            );
        }

        debug!(?report, "Maintenance pass complete");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::{BusSettings, LockSettings, SyncSettings, TransactionSettings};
    use crate::lock::LockService;
    use crate::targets::{CacheTarget, SyncTarget};
    use keystone_core::Operation;
    use keystone_store::{MemoryGraph, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    fn worker() -> (MaintenanceWorker, MaintenanceHandle, TransactionalWriter) {
        let store = Arc::new(MemoryStore::new());
        let dead_letters = DeadLetterQueue::new(store.clone());
        let settings = SyncSettings::default();
        let bus = EventBus::new(BusSettings::default(), dead_letters.clone());
        let targets: Vec<Arc<dyn SyncTarget>> =
            vec![Arc::new(CacheTarget::new(store.clone(), settings.cache_rules()))];
        let coordinator =
            ConsistencyCoordinator::new(settings, store.clone(), bus, targets, dead_letters.clone())
                .unwrap();
        let writer = TransactionalWriter::new(
            TransactionSettings::default(),
            store.clone(),
            Arc::new(MemoryGraph::new()),
            LockService::new(store, LockSettings::default()),
            dead_letters.clone(),
        );
        let (worker, handle) = MaintenanceWorker::new(
            MaintenanceSettings {
                retry_backlog_warning: 0,
                ..MaintenanceSettings::default()
            },
            coordinator,
            writer.clone(),
            dead_letters,
        );
        (worker, handle, writer)
    }

    #[tokio::test]
    async fn test_run_once_reports_backlog() {
        let (worker, _handle, writer) = worker();

        writer.begin("tx1").await.unwrap();
        writer
            .add_operation(
                "tx1",
                Operation::create_relationship("r1", "NEEDS", "x", "y", json!({})),
            )
            .await
            .unwrap();
        assert!(writer.commit("tx1").await.is_err());

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.operation_retries.attempted, 0);
        assert_eq!(report.pending_operation_retries, 1);
        assert_eq!(report.pending_sync_retries, 0);
        assert_eq!(report.dead_letters, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stops_on_shutdown() {
        let (worker, handle, _writer) = worker();
        let task = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_secs(65)).await;
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
