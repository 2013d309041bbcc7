//! Applitrack Sync - offline-first sync engine
//!
//! Backend engine for the Applitrack desktop app. The UI shell talks to
//! the `SyncEngine` facade; entity repositories append outbox entries
//! inside their own transactions; everything else (draining, retries,
//! conflicts, the shutdown drain) happens behind this module boundary.

pub mod db;
pub mod sync;

use std::sync::Arc;

use db::{Database, DbError};
use rusqlite::Connection;
use sync::api::RemoteEndpoint;
use sync::conflict::{ConflictChoice, ConflictInfo};
use sync::models::{
    ConnectionReport, EngineStatus, EntityKind, NewOutboxEntry, Operation, SyncConfig,
    SyncConfigPatch, SyncSummary,
};
use sync::outbox::{OutboxError, OutboxStore};
use sync::processor::{DrainOutcome, LocalStore, ProcessorError, SyncProcessor};
use sync::scheduler::{BackgroundScheduler, SchedulerError};
use sync::shutdown::{CancelHandle, ShutdownCoordinator, ShutdownOutcome};
use sync::status::StatusReporter;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Sync error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// The narrow bridge between the host application and the sync engine.
///
/// One instance per running app. Every collaborator is injected, so tests
/// (and future shells) can build independent engines against in-memory
/// databases and scripted remotes.
#[derive(Clone)]
pub struct SyncEngine {
    db: Arc<Database>,
    outbox: OutboxStore,
    processor: SyncProcessor,
    scheduler: BackgroundScheduler,
    status: StatusReporter,
    shutdown: ShutdownCoordinator,
}

impl SyncEngine {
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteEndpoint>,
        local_store: Arc<dyn LocalStore>,
    ) -> Result<Self, EngineError> {
        // Materialize the config on first run so device_id is stable.
        SyncConfig::load_or_init(&db)?;

        let processor = SyncProcessor::new(db.clone(), remote, local_store);
        let scheduler = BackgroundScheduler::new(db.clone(), processor.clone());
        let status = StatusReporter::new(db.clone(), processor.clone());
        let shutdown = ShutdownCoordinator::new(processor.clone(), status.clone());

        Ok(Self {
            outbox: OutboxStore::new(db.clone()),
            db,
            processor,
            scheduler,
            status,
            shutdown,
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // ========================================================================
    // Repository-facing API
    // ========================================================================

    /// Append an outbox entry using the caller's connection.
    ///
    /// Repositories call this inside the transaction that performs the
    /// entity mutation; both writes commit or roll back together.
    pub fn enqueue_in(
        &self,
        conn: &Connection,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Option<serde_json::Value>,
    ) -> Result<i64, EngineError> {
        let id = self.outbox.enqueue_in(
            conn,
            NewOutboxEntry {
                entity_kind,
                entity_id: entity_id.into(),
                operation,
                payload,
            },
        )?;
        Ok(id)
    }

    /// Append an outbox entry in its own transaction.
    pub fn enqueue(
        &self,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Option<serde_json::Value>,
    ) -> Result<i64, EngineError> {
        let id = self.outbox.enqueue(NewOutboxEntry {
            entity_kind,
            entity_id: entity_id.into(),
            operation,
            payload,
        })?;
        Ok(id)
    }

    // ========================================================================
    // UI-facing API
    // ========================================================================

    pub fn get_status(&self) -> Result<EngineStatus, EngineError> {
        Ok(self.status.report()?)
    }

    /// Run one drain now. A second call while a drain is in flight is a
    /// no-op that reports success with zero counts.
    pub async fn trigger_manual_sync(&self) -> Result<SyncSummary, EngineError> {
        match self.processor.drain(None).await? {
            DrainOutcome::Completed(report) => Ok(SyncSummary {
                success: report.permanent_failures == 0 && report.transient_failures == 0,
                synced_count: report.synced,
                failed_count: report.transient_failures + report.permanent_failures,
                conflict_count: report.conflicts,
            }),
            DrainOutcome::AlreadyRunning => Ok(SyncSummary {
                success: true,
                synced_count: 0,
                failed_count: 0,
                conflict_count: 0,
            }),
        }
    }

    /// Final drain before exit; see `ShutdownCoordinator`.
    pub async fn perform_shutdown_sync<F>(
        &self,
        on_progress: F,
    ) -> Result<ShutdownOutcome, EngineError>
    where
        F: FnMut(String),
    {
        Ok(self.shutdown.run(on_progress).await?)
    }

    pub fn shutdown_cancel_handle(&self) -> CancelHandle {
        self.shutdown.cancel_handle()
    }

    /// Apply a partial config update; takes effect on the next scheduling
    /// tick, never mid-drain.
    pub fn update_sync_config(&self, patch: SyncConfigPatch) -> Result<SyncConfig, EngineError> {
        let mut config = SyncConfig::load_or_init(&self.db)?;
        patch.apply_to(&mut config);
        config.save(&self.db)?;
        log::info!(
            "Sync config updated: auto={}, interval={}s, conflicts={:?}",
            config.auto_sync_enabled,
            config.sync_interval_secs,
            config.conflict_resolution
        );
        Ok(config)
    }

    pub fn get_sync_config(&self) -> Result<SyncConfig, EngineError> {
        Ok(SyncConfig::load_or_init(&self.db)?)
    }

    /// Force a connectivity probe and, if the remote answers, a drain.
    pub async fn retry_connection(&self) -> Result<ConnectionReport, EngineError> {
        if !self.processor.probe().await {
            return Ok(ConnectionReport {
                success: false,
                message: "Sync server is unreachable.".to_string(),
            });
        }

        let summary = self.trigger_manual_sync().await?;
        Ok(ConnectionReport {
            success: true,
            message: format!("Connected. Synced {} change(s).", summary.synced_count),
        })
    }

    /// Entries parked for a user decision.
    pub fn list_conflicts(&self) -> Result<Vec<ConflictInfo>, EngineError> {
        let conflicts = self
            .outbox
            .list_conflicts()?
            .iter()
            .map(ConflictInfo::from_entry)
            .collect();
        Ok(conflicts)
    }

    /// Apply the user's decision to a parked conflict entry.
    pub async fn resolve_conflict(
        &self,
        entry_id: i64,
        choice: ConflictChoice,
    ) -> Result<(), EngineError> {
        self.processor.resolve_conflict(entry_id, choice).await?;
        Ok(())
    }

    /// Reset failed entries for another round of automatic retries.
    pub fn retry_failed(&self) -> Result<usize, EngineError> {
        Ok(self.outbox.reset_failed()?)
    }

    /// Housekeeping: drop synced entries older than `days`.
    pub fn purge_synced(&self, days: i64) -> Result<usize, EngineError> {
        Ok(self.outbox.purge_synced(days)?)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the background scheduler; call once at app startup.
    pub fn start_auto_sync(&self) -> Result<(), EngineError> {
        self.scheduler.start()?;
        Ok(())
    }

    /// Stop the background scheduler; call at teardown.
    pub fn stop_auto_sync(&self) -> Result<(), EngineError> {
        self.scheduler.stop()?;
        Ok(())
    }

    pub fn auto_sync_running(&self) -> bool {
        self.scheduler.is_running()
    }
}

// ============================================================================
// Tests
// ============================================================================
