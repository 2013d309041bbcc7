//! Sync Data Models
//!
//! Defines the structures shared across the sync engine:
//! - OutboxEntry: one intended mutation against one remote-tracked entity
//! - SyncConfig: user-controlled sync policy, persisted in settings
//! - EngineStatus: derived engine state for the UI and shutdown decision

use crate::db::{Database, DbResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Settings key holding the serialized `SyncConfig`.
pub const SYNC_CONFIG_KEY: &str = "sync_config";

/// Floor for the automatic sync interval, to bound load on the remote.
pub const MIN_SYNC_INTERVAL_SECS: u64 = 30;

/// Default retry ceiling before an entry is parked as failed.
pub const DEFAULT_RETRY_CEILING: u32 = 3;

// ============================================================================
// Entity Kinds & Operations
// ============================================================================

/// Remote-tracked entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Application,
    Company,
    Contact,
    Reminder,
    Attachment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Company => "company",
            Self::Contact => "contact",
            Self::Reminder => "reminder",
            Self::Attachment => "attachment",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "application" => Self::Application,
            "company" => Self::Company,
            "reminder" => Self::Reminder,
            "attachment" => Self::Attachment,
            _ => Self::Contact,
        }
    }
}

/// Mutation operation carried by an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "create" => Self::Create,
            "delete" => Self::Delete,
            _ => Self::Update,
        }
    }
}

// ============================================================================
// Outbox Entry
// ============================================================================

/// Persisted state of an outbox entry.
///
/// `Pending` covers both fresh entries and entries awaiting a backoff
/// deadline after a transient failure. `Conflict` is a parked entry waiting
/// for a user decision; it leaves that state only through
/// `resolve_conflict`. `Synced` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Pending,
    Synced,
    Failed,
    Conflict,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "synced" => Self::Synced,
            "failed" => Self::Failed,
            "conflict" => Self::Conflict,
            _ => Self::Pending,
        }
    }
}

/// One intended mutation against one remote-tracked entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    /// Snapshot of the record's fields at enqueue time; None for Delete.
    pub payload: Option<serde_json::Value>,
    /// Remote version this mutation was based on (0 = never pushed).
    pub base_version: i64,
    pub state: EntryState,
    pub enqueued_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set when a conflict was resolved in favor of local; the next push
    /// carries force = true.
    pub force_push: bool,
}

/// Input for a new outbox entry; everything else is stamped at enqueue time.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Option<serde_json::Value>,
}

// ============================================================================
// Sync Configuration
// ============================================================================

/// Conflict resolution mode chosen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Park the entry and let the user decide.
    Ask,
    /// Overwrite the remote record with the local payload.
    PreferLocal,
    /// Discard the local entry and pull the remote record.
    PreferRemote,
}

/// Sync policy, persisted under the `sync_config` settings key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub auto_sync_enabled: bool,
    pub sync_interval_secs: u64,
    pub conflict_resolution: ConflictResolution,
    pub retry_ceiling: u32,
    /// Stable client identifier, generated once and sent with every push.
    pub device_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_enabled: false,
            sync_interval_secs: 300,
            conflict_resolution: ConflictResolution::Ask,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            device_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl SyncConfig {
    /// Clamp user-supplied values into their allowed ranges.
    pub fn normalize(&mut self) {
        if self.sync_interval_secs < MIN_SYNC_INTERVAL_SECS {
            self.sync_interval_secs = MIN_SYNC_INTERVAL_SECS;
        }
        if self.retry_ceiling == 0 {
            self.retry_ceiling = 1;
        }
    }

    /// Load the persisted config, creating and persisting the default on
    /// first run so `device_id` stays stable across sessions.
    pub fn load_or_init(db: &Database) -> DbResult<Self> {
        match db.get_setting::<SyncConfig>(SYNC_CONFIG_KEY)? {
            Some(mut config) => {
                config.normalize();
                Ok(config)
            }
            None => {
                let config = SyncConfig::default();
                db.set_setting(SYNC_CONFIG_KEY, &config)?;
                Ok(config)
            }
        }
    }

    pub fn save(&self, db: &Database) -> DbResult<()> {
        db.set_setting(SYNC_CONFIG_KEY, self)
    }
}

/// Partial update for `SyncConfig`; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfigPatch {
    pub auto_sync_enabled: Option<bool>,
    pub sync_interval_secs: Option<u64>,
    pub conflict_resolution: Option<ConflictResolution>,
    pub retry_ceiling: Option<u32>,
}

impl SyncConfigPatch {
    pub fn apply_to(&self, config: &mut SyncConfig) {
        if let Some(enabled) = self.auto_sync_enabled {
            config.auto_sync_enabled = enabled;
        }
        if let Some(secs) = self.sync_interval_secs {
            config.sync_interval_secs = secs;
        }
        if let Some(mode) = self.conflict_resolution {
            config.conflict_resolution = mode;
        }
        if let Some(ceiling) = self.retry_ceiling {
            config.retry_ceiling = ceiling;
        }
        config.normalize();
    }
}

// ============================================================================
// Engine Status
// ============================================================================

/// Derived engine state; recomputed on every call, never cached.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_count: i64,
    pub failed_count: i64,
    pub conflict_count: i64,
    pub sync_in_progress: bool,
    pub remote_reachable: bool,
}

/// Result of a manual sync trigger.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub success: bool,
    pub synced_count: usize,
    pub failed_count: usize,
    pub conflict_count: usize,
}

/// Result of a forced connectivity probe.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub success: bool,
    pub message: String,
}

// ============================================================================
// Tests
// ============================================================================
