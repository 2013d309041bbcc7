//! Conflict Policy - pure decision logic for diverged records
//!
//! A conflict is a push the remote rejected because the record's version
//! moved past the entry's base version. The policy maps the configured
//! resolution mode to an action; it performs no I/O, so the processor and
//! the bridge can both call it and tests can table-drive it.

use super::models::{ConflictResolution, OutboxEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What to do about a diverged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Overwrite the remote record; the push is retried as a forced update.
    AcceptLocal,
    /// Discard the local entry and apply the remote record locally.
    AcceptRemote,
    /// Park the entry until the user picks a side.
    DeferToUser,
}

/// The user's retroactive decision for a parked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    KeepLocal,
    KeepRemote,
}

/// Everything known about a detected divergence.
#[derive(Debug, Clone)]
pub struct ConflictContext {
    pub remote_version: i64,
    pub remote_payload: Option<serde_json::Value>,
}

/// Conflict summary surfaced to the UI for Ask-mode decisions.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictInfo {
    pub entry_id: i64,
    pub entity_kind: String,
    pub entity_id: String,
    pub operation: String,
    pub enqueued_at: DateTime<Utc>,
    pub local_payload: Option<serde_json::Value>,
    pub base_version: i64,
}

impl ConflictInfo {
    pub fn from_entry(entry: &OutboxEntry) -> Self {
        Self {
            entry_id: entry.id,
            entity_kind: entry.entity_kind.as_str().to_string(),
            entity_id: entry.entity_id.clone(),
            operation: entry.operation.as_str().to_string(),
            enqueued_at: entry.enqueued_at,
            local_payload: entry.payload.clone(),
            base_version: entry.base_version,
        }
    }
}

/// Map the configured resolution mode to a decision.
pub fn resolve(mode: ConflictResolution, _ctx: &ConflictContext) -> ConflictDecision {
    match mode {
        ConflictResolution::PreferLocal => ConflictDecision::AcceptLocal,
        ConflictResolution::PreferRemote => ConflictDecision::AcceptRemote,
        ConflictResolution::Ask => ConflictDecision::DeferToUser,
    }
}

// ============================================================================
// Tests
// ============================================================================
