//! Outbox Store - durable log of pending remote mutations
//!
//! Entity repositories append entries inside their own transaction, so a
//! local write and its outbox entry either both commit or both roll back.
//! The sync processor is the only writer of entry state after that.
//!
//! Features:
//! - SQLite-backed persistent queue, FIFO per entity
//! - Exponential backoff with persisted retry deadlines
//! - Retry ceiling with manual reset
//! - Remote version bookkeeping for conflict detection
//! - State counts for the status reporter

use super::models::{EntityKind, EntryState, NewOutboxEntry, Operation, OutboxEntry};
use crate::db::{Database, DbError};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use std::sync::Arc;

const BASE_DELAY_SECS: i64 = 30; // First retry delay
const MAX_DELAY_SECS: i64 = 3600; // Backoff cap

const ENTRY_COLUMNS: &str = "id, entity_kind, entity_id, operation, payload, base_version, \
     state, enqueued_at, synced_at, retry_count, next_retry_at, last_error, force_push";

/// Aggregate entry counts by state.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StateCounts {
    pub pending: i64,
    pub failed: i64,
    pub conflicts: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Outbox entry not found: {0}")]
    EntryNotFound(i64),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Entry {0} is not awaiting a decision")]
    NotInConflict(i64),
}

/// Manages the `sync_outbox` and `sync_remote_versions` tables.
///
/// No network access happens here; side effects are confined to those two
/// tables.
#[derive(Clone)]
pub struct OutboxStore {
    db: Arc<Database>,
}

impl OutboxStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Append one entry using the caller's connection.
    ///
    /// Repositories call this inside the transaction that performs the
    /// entity mutation itself; if either write fails the caller rolls back
    /// both. `base_version` is stamped from the remote-version table through
    /// the same connection.
    pub fn enqueue_in(&self, conn: &Connection, entry: NewOutboxEntry) -> Result<i64, OutboxError> {
        if entry.operation != Operation::Delete && entry.payload.is_none() {
            return Err(OutboxError::InvalidPayload(format!(
                "{} {} requires a payload snapshot",
                entry.operation.as_str(),
                entry.entity_kind.as_str()
            )));
        }

        let base_version: i64 = conn
            .query_row(
                "SELECT version FROM sync_remote_versions WHERE entity_kind = ?1 AND entity_id = ?2",
                params![entry.entity_kind.as_str(), entry.entity_id],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let payload_json = entry
            .payload
            .as_ref()
            .map(|p| serde_json::to_string(p))
            .transpose()
            .map_err(|e| OutboxError::InvalidPayload(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO sync_outbox (
                entity_kind, entity_id, operation, payload, base_version,
                state, enqueued_at, retry_count, force_push
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, 0, 0)
            "#,
            params![
                entry.entity_kind.as_str(),
                entry.entity_id,
                entry.operation.as_str(),
                payload_json,
                base_version,
                Utc::now().to_rfc3339(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        log::info!(
            "Enqueued {} {} for {} (outbox id {})",
            entry.operation.as_str(),
            entry.entity_kind.as_str(),
            entry.entity_id,
            id
        );
        Ok(id)
    }

    /// Append one entry in its own transaction, for callers that are not
    /// already inside one.
    pub fn enqueue(&self, entry: NewOutboxEntry) -> Result<i64, OutboxError> {
        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction()?;
        let id = self.enqueue_in(&tx, entry)?;
        tx.commit()?;
        Ok(id)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Pending entries eligible for a push at `now`, FIFO.
    pub fn list_eligible(
        &self,
        limit: usize,
        ceiling: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let entries = self.db.query(
            &format!(
                r#"
                SELECT {ENTRY_COLUMNS}
                FROM sync_outbox
                WHERE state = 'pending'
                  AND retry_count < ?1
                  AND (next_retry_at IS NULL OR next_retry_at <= ?2)
                ORDER BY enqueued_at ASC, id ASC
                LIMIT ?3
                "#
            ),
            params![ceiling, now.to_rfc3339(), limit as i64],
            map_entry_row,
        )?;

        Ok(entries)
    }

    /// Whether an earlier, not-yet-synced entry exists for the same entity.
    ///
    /// Guards per-entity FIFO: a later Update/Delete must wait until every
    /// earlier entry for that entity has been delivered or discarded.
    pub fn has_earlier_undelivered(
        &self,
        entity_kind: EntityKind,
        entity_id: &str,
        before_id: i64,
    ) -> Result<bool, OutboxError> {
        let exists: i64 = self.db.query_row(
            r#"
            SELECT COUNT(*) FROM sync_outbox
            WHERE entity_kind = ?1 AND entity_id = ?2
              AND id < ?3 AND state != 'synced'
            "#,
            params![entity_kind.as_str(), entity_id, before_id],
            |row| row.get(0),
        )?;
        Ok(exists > 0)
    }

    pub fn get_entry(&self, id: i64) -> Result<OutboxEntry, OutboxError> {
        let entries = self.db.query(
            &format!("SELECT {ENTRY_COLUMNS} FROM sync_outbox WHERE id = ?1"),
            params![id],
            map_entry_row,
        )?;

        entries.into_iter().next().ok_or(OutboxError::EntryNotFound(id))
    }

    /// Entries parked for a user decision, oldest first.
    pub fn list_conflicts(&self) -> Result<Vec<OutboxEntry>, OutboxError> {
        let entries = self.db.query(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM sync_outbox \
                 WHERE state = 'conflict' ORDER BY enqueued_at ASC, id ASC"
            ),
            [],
            map_entry_row,
        )?;
        Ok(entries)
    }

    pub fn count_by_state(&self) -> Result<StateCounts, OutboxError> {
        let counts = self.db.query_row(
            r#"
            SELECT
                SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END),
                SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END),
                SUM(CASE WHEN state = 'conflict' THEN 1 ELSE 0 END)
            FROM sync_outbox
            "#,
            [],
            |row| {
                Ok(StateCounts {
                    pending: row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                    failed: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    conflicts: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                })
            },
        )?;
        Ok(counts)
    }

    /// Last remote-acknowledged version for an entity (0 = never pushed).
    pub fn remote_version(
        &self,
        entity_kind: EntityKind,
        entity_id: &str,
    ) -> Result<i64, OutboxError> {
        let version = self
            .db
            .query(
                "SELECT version FROM sync_remote_versions WHERE entity_kind = ?1 AND entity_id = ?2",
                params![entity_kind.as_str(), entity_id],
                |row| row.get::<_, i64>(0),
            )?
            .into_iter()
            .next()
            .unwrap_or(0);
        Ok(version)
    }

    // ========================================================================
    // State transitions (sync processor only)
    // ========================================================================

    /// Terminal: the remote accepted the entry.
    pub fn mark_synced(&self, id: i64, new_version: i64) -> Result<(), OutboxError> {
        let entry = self.get_entry(id)?;

        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            UPDATE sync_outbox
            SET state = 'synced', synced_at = ?1, last_error = NULL,
                next_retry_at = NULL, force_push = 0
            WHERE id = ?2
            "#,
            params![Utc::now().to_rfc3339(), id],
        )?;
        upsert_remote_version(&tx, entry.entity_kind, &entry.entity_id, new_version)?;
        tx.commit()?;

        log::info!(
            "Outbox entry {} synced ({} {} -> v{})",
            id,
            entry.entity_kind.as_str(),
            entry.entity_id,
            new_version
        );
        Ok(())
    }

    /// Terminal: the entry was discarded in favor of the remote record.
    pub fn mark_superseded(&self, id: i64, remote_version: i64) -> Result<(), OutboxError> {
        let entry = self.get_entry(id)?;

        let mut conn = self.db.get_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            UPDATE sync_outbox
            SET state = 'synced', synced_at = ?1, last_error = 'superseded',
                next_retry_at = NULL, force_push = 0
            WHERE id = ?2
            "#,
            params![Utc::now().to_rfc3339(), id],
        )?;
        upsert_remote_version(&tx, entry.entity_kind, &entry.entity_id, remote_version)?;
        tx.commit()?;

        log::info!(
            "Outbox entry {} superseded by remote v{}",
            id,
            remote_version
        );
        Ok(())
    }

    /// Record a transient push failure and schedule the next attempt.
    ///
    /// Flips the entry to `Failed` once `retry_count` reaches the ceiling.
    pub fn mark_transient_failure(
        &self,
        id: i64,
        error: &str,
        ceiling: u32,
    ) -> Result<EntryState, OutboxError> {
        let entry = self.get_entry(id)?;
        let new_retry_count = entry.retry_count + 1;

        if new_retry_count >= ceiling {
            self.db.execute(
                r#"
                UPDATE sync_outbox
                SET state = 'failed', retry_count = ?1, last_error = ?2, next_retry_at = NULL
                WHERE id = ?3
                "#,
                params![new_retry_count, error, id],
            )?;
            log::warn!(
                "Outbox entry {} exceeded retry ceiling ({}): {}",
                id,
                ceiling,
                error
            );
            return Ok(EntryState::Failed);
        }

        let delay_secs = (BASE_DELAY_SECS * 2_i64.pow(new_retry_count)).min(MAX_DELAY_SECS);
        let next_retry = Utc::now() + Duration::seconds(delay_secs);

        self.db.execute(
            r#"
            UPDATE sync_outbox
            SET retry_count = ?1, last_error = ?2, next_retry_at = ?3
            WHERE id = ?4
            "#,
            params![new_retry_count, error, next_retry.to_rfc3339(), id],
        )?;
        log::warn!(
            "Outbox entry {} failed transiently (attempt {}/{}), retrying after {}: {}",
            id,
            new_retry_count,
            ceiling,
            next_retry.to_rfc3339(),
            error
        );
        Ok(EntryState::Pending)
    }

    /// Record a permanent rejection; no automatic retries remain.
    pub fn mark_permanent_failure(
        &self,
        id: i64,
        error: &str,
        ceiling: u32,
    ) -> Result<(), OutboxError> {
        self.db.execute(
            r#"
            UPDATE sync_outbox
            SET state = 'failed', retry_count = ?1, last_error = ?2, next_retry_at = NULL
            WHERE id = ?3
            "#,
            params![ceiling, error, id],
        )?;
        log::error!("Outbox entry {} permanently rejected: {}", id, error);
        Ok(())
    }

    /// Park the entry for a user decision.
    pub fn mark_conflict(&self, id: i64) -> Result<(), OutboxError> {
        self.db.execute(
            "UPDATE sync_outbox SET state = 'conflict', last_error = 'conflict' WHERE id = ?1",
            params![id],
        )?;
        log::info!("Outbox entry {} awaiting user conflict decision", id);
        Ok(())
    }

    /// User chose to keep the local version: back to pending as a forced push.
    pub fn resolve_keep_local(&self, id: i64) -> Result<(), OutboxError> {
        let entry = self.get_entry(id)?;
        if entry.state != EntryState::Conflict {
            return Err(OutboxError::NotInConflict(id));
        }

        self.db.execute(
            r#"
            UPDATE sync_outbox
            SET state = 'pending', force_push = 1, last_error = NULL,
                retry_count = 0, next_retry_at = NULL
            WHERE id = ?1
            "#,
            params![id],
        )?;
        Ok(())
    }

    /// Reset one failed entry back to pending.
    pub fn reset_for_retry(&self, id: i64) -> Result<(), OutboxError> {
        self.db.execute(
            r#"
            UPDATE sync_outbox
            SET state = 'pending', retry_count = 0, next_retry_at = NULL, last_error = NULL
            WHERE id = ?1 AND state = 'failed'
            "#,
            params![id],
        )?;
        Ok(())
    }

    /// Reset every failed entry back to pending; returns how many.
    pub fn reset_failed(&self) -> Result<usize, OutboxError> {
        let updated = self.db.execute(
            r#"
            UPDATE sync_outbox
            SET state = 'pending', retry_count = 0, next_retry_at = NULL, last_error = NULL
            WHERE state = 'failed'
            "#,
            [],
        )?;
        log::info!("Reset {} failed outbox entries for retry", updated);
        Ok(updated)
    }

    /// Delete synced entries older than `older_than_days`.
    pub fn purge_synced(&self, older_than_days: i64) -> Result<usize, OutboxError> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let deleted = self.db.execute(
            "DELETE FROM sync_outbox WHERE state = 'synced' AND synced_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        if deleted > 0 {
            log::info!("Purged {} synced outbox entries", deleted);
        }
        Ok(deleted)
    }
}

fn upsert_remote_version(
    conn: &Connection,
    entity_kind: EntityKind,
    entity_id: &str,
    version: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        r#"
        INSERT INTO sync_remote_versions (entity_kind, entity_id, version)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(entity_kind, entity_id) DO UPDATE SET version = excluded.version
        "#,
        params![entity_kind.as_str(), entity_id, version],
    )?;
    Ok(())
}

fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let payload: Option<String> = row.get(4)?;
    let payload = payload
        .map(|p| serde_json::from_str(&p))
        .transpose()
        .map_err(|_| rusqlite::Error::InvalidQuery)?;

    Ok(OutboxEntry {
        id: row.get(0)?,
        entity_kind: EntityKind::from_str(&row.get::<_, String>(1)?),
        entity_id: row.get(2)?,
        operation: Operation::from_str(&row.get::<_, String>(3)?),
        payload,
        base_version: row.get(5)?,
        state: EntryState::from_str(&row.get::<_, String>(6)?),
        enqueued_at: parse_timestamp(&row.get::<_, String>(7)?)?,
        synced_at: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_timestamp(&s))
            .transpose()?,
        retry_count: row.get(9)?,
        next_retry_at: row
            .get::<_, Option<String>>(10)?
            .map(|s| parse_timestamp(&s))
            .transpose()?,
        last_error: row.get(11)?,
        force_push: row.get::<_, i64>(12)? != 0,
    })
}

fn parse_timestamp(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

// ============================================================================
// Tests
// ============================================================================
