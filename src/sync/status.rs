//! Status Reporter
//!
//! Side-effect-free aggregation of engine state for UI polling and for the
//! shutdown decision. Counts are re-queried on every call — the shutdown
//! coordinator's correctness depends on an accurate pending count, so
//! nothing here is cached.

use super::models::EngineStatus;
use super::outbox::{OutboxError, OutboxStore};
use super::processor::{SyncProcessor, LAST_SYNC_AT_KEY};
use crate::db::Database;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct StatusReporter {
    db: Arc<Database>,
    outbox: OutboxStore,
    processor: SyncProcessor,
}

impl StatusReporter {
    pub fn new(db: Arc<Database>, processor: SyncProcessor) -> Self {
        Self {
            outbox: OutboxStore::new(db.clone()),
            db,
            processor,
        }
    }

    /// Current engine state, fresh from the outbox.
    pub fn report(&self) -> Result<EngineStatus, OutboxError> {
        let counts = self.outbox.count_by_state()?;

        let last_sync_at = self
            .db
            .get_setting::<String>(LAST_SYNC_AT_KEY)?
            .and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            });

        Ok(EngineStatus {
            last_sync_at,
            pending_count: counts.pending,
            failed_count: counts.failed,
            conflict_count: counts.conflicts,
            sync_in_progress: self.processor.is_draining(),
            remote_reachable: self.processor.remote_reachable(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
