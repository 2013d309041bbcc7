//! Background Sync Scheduler
//!
//! Periodic drain trigger on a Tokio task. Replaces ad-hoc UI timers with
//! one explicit loop: configuration is re-read every tick, so user changes
//! take effect on the next tick and never land mid-drain. Overlap with a
//! manual drain is harmless — the processor lock turns the tick into a
//! no-op.

use super::models::SyncConfig;
use super::processor::SyncProcessor;
use crate::db::Database;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,
}

/// Background scheduler for automatic drains.
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    processor: SyncProcessor,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl BackgroundScheduler {
    pub fn new(db: Arc<Database>, processor: SyncProcessor) -> Self {
        Self {
            db,
            processor,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Start the background task.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let running = self.running.clone();
        let db = self.db.clone();
        let processor = self.processor.clone();

        let handle = tokio::spawn(async move {
            Self::scheduler_loop(running, db, processor).await;
        });

        if let Ok(mut guard) = self.task_handle.lock() {
            *guard = Some(handle);
        }

        log::info!("Background scheduler started");
        Ok(())
    }

    /// Stop the background task.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Ok(mut guard) = self.task_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Background loop (runs in the spawned task).
    async fn scheduler_loop(running: Arc<AtomicBool>, db: Arc<Database>, processor: SyncProcessor) {
        loop {
            // Interval is re-read each round so updates apply on the next
            // tick without a restart.
            let config = match SyncConfig::load_or_init(&db) {
                Ok(config) => config,
                Err(e) => {
                    log::error!("Scheduler failed to load sync config: {}", e);
                    break;
                }
            };

            tokio::time::sleep(std::time::Duration::from_secs(config.sync_interval_secs)).await;

            if !running.load(Ordering::SeqCst) {
                break;
            }

            let config = match SyncConfig::load_or_init(&db) {
                Ok(config) => config,
                Err(e) => {
                    log::error!("Scheduler failed to load sync config: {}", e);
                    break;
                }
            };
            if !config.auto_sync_enabled {
                continue;
            }

            log::info!("Automatic sync triggered by scheduler");
            match processor.drain(None).await {
                Ok(outcome) => log::debug!("Scheduled drain finished: {:?}", outcome),
                Err(e) => log::error!("Scheduled drain failed: {}", e),
            }
        }

        running.store(false, Ordering::SeqCst);
        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
