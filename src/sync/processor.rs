//! Sync Processor - drives the outbox to empty against the remote
//!
//! A drain fetches eligible entries in FIFO order and pushes them one at a
//! time. Exactly one drain runs at a time; a second trigger is a no-op,
//! not an error. A transient failure stops further entries for the same
//! entity (ordering) but independent entities continue. Conflicts are
//! routed through the conflict policy.

use super::api::{PushOutcome, PushRequest, RemoteEndpoint, RemoteError};
use super::conflict::{self, ConflictChoice, ConflictContext, ConflictDecision};
use super::models::{EntityKind, EntryState, SyncConfig};
use super::outbox::{OutboxError, OutboxStore};
use crate::db::{Database, DbError};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Entries pushed per drain round.
const BATCH_LIMIT: usize = 50;

/// Settings key for the last fully successful drain timestamp.
pub const LAST_SYNC_AT_KEY: &str = "last_sync_at";

/// Seam to the repository layer: applies a remote record to the local
/// entity tables when a conflict is resolved in the remote's favor.
/// `payload = None` means the record no longer exists remotely.
pub trait LocalStore: Send + Sync {
    fn apply_remote_record(
        &self,
        entity_kind: EntityKind,
        entity_id: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), DbError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Entry {0} is not awaiting a decision")]
    NotInConflict(i64),
}

/// Tally of one drain.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainReport {
    pub synced: usize,
    pub transient_failures: usize,
    pub permanent_failures: usize,
    pub conflicts: usize,
    pub cancelled: bool,
}

impl DrainReport {
    /// True when every pushed entry landed.
    pub fn clean(&self) -> bool {
        self.transient_failures == 0 && self.permanent_failures == 0 && self.conflicts == 0
    }
}

/// Result of a drain trigger.
#[derive(Debug)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another drain already holds the lock; nothing was done.
    AlreadyRunning,
}

/// Drains the outbox against the remote endpoint.
///
/// Constructed once per engine; all collaborators are injected so tests
/// can run independent instances side by side.
#[derive(Clone)]
pub struct SyncProcessor {
    db: Arc<Database>,
    outbox: OutboxStore,
    remote: Arc<dyn RemoteEndpoint>,
    local_store: Arc<dyn LocalStore>,
    draining: Arc<AtomicBool>,
    remote_reachable: Arc<AtomicBool>,
}

impl SyncProcessor {
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteEndpoint>,
        local_store: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            outbox: OutboxStore::new(db.clone()),
            db,
            remote,
            local_store,
            draining: Arc::new(AtomicBool::new(false)),
            remote_reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn outbox(&self) -> &OutboxStore {
        &self.outbox
    }

    /// True while a drain holds the processing lock.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Result of the last connectivity probe.
    pub fn remote_reachable(&self) -> bool {
        self.remote_reachable.load(Ordering::SeqCst)
    }

    /// Probe the remote and record the result.
    pub async fn probe(&self) -> bool {
        let reachable = self.remote.probe().await;
        self.remote_reachable.store(reachable, Ordering::SeqCst);
        reachable
    }

    /// Run one drain. Returns `AlreadyRunning` immediately when another
    /// drain holds the lock.
    ///
    /// `cancel` is checked between entries, never mid-push.
    pub async fn drain(&self, cancel: Option<&AtomicBool>) -> Result<DrainOutcome, ProcessorError> {
        // Exclusive in-process lock; released by the guard on every path.
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("Drain already in progress, skipping");
            return Ok(DrainOutcome::AlreadyRunning);
        }
        let _guard = DrainGuard(self.draining.clone());

        // Config is read once per drain; mid-drain changes wait for the next.
        let config = SyncConfig::load_or_init(&self.db)?;

        let mut report = DrainReport::default();
        let mut blocked: HashSet<(EntityKind, String)> = HashSet::new();

        loop {
            let entries = self
                .outbox
                .list_eligible(BATCH_LIMIT, config.retry_ceiling, Utc::now())?;

            if entries.is_empty() {
                break;
            }

            log::info!("Draining batch of {} outbox entries", entries.len());
            let synced_before = report.synced;

            for entry in entries {
                if let Some(flag) = cancel {
                    if flag.load(Ordering::SeqCst) {
                        log::info!("Drain cancelled before entry {}", entry.id);
                        report.cancelled = true;
                        break;
                    }
                }

                let key = (entry.entity_kind, entry.entity_id.clone());
                if blocked.contains(&key) {
                    continue;
                }
                // An earlier undelivered entry for this entity (failed or
                // parked in a previous drain) must go first.
                if self
                    .outbox
                    .has_earlier_undelivered(entry.entity_kind, &entry.entity_id, entry.id)?
                {
                    continue;
                }

                let request = PushRequest {
                    entity_kind: entry.entity_kind,
                    entity_id: entry.entity_id.clone(),
                    operation: entry.operation,
                    payload: entry.payload.clone(),
                    base_version: entry.base_version,
                    force: entry.force_push,
                    device_id: config.device_id.clone(),
                };

                match self.remote.push(&request).await {
                    Ok(PushOutcome::Accepted { new_version }) => {
                        self.outbox.mark_synced(entry.id, new_version)?;
                        report.synced += 1;
                    }
                    Ok(PushOutcome::Conflict {
                        remote_version,
                        remote_payload,
                    }) => {
                        self.handle_conflict(
                            &config,
                            &request,
                            entry.id,
                            remote_version,
                            remote_payload,
                            &mut report,
                            &mut blocked,
                        )
                        .await?;
                    }
                    Ok(PushOutcome::Rejected { reason }) => {
                        self.outbox
                            .mark_permanent_failure(entry.id, &reason, config.retry_ceiling)?;
                        report.permanent_failures += 1;
                    }
                    Err(e) => {
                        self.record_transient_failure(
                            entry.id,
                            &e.to_string(),
                            &config,
                            key,
                            &mut report,
                            &mut blocked,
                        )?;
                    }
                }
            }

            // Entries skipped behind a blocker stay eligible; stop once a
            // full batch delivers nothing.
            if report.cancelled || report.synced == synced_before {
                break;
            }
        }

        if !report.cancelled && report.clean() {
            let counts = self.outbox.count_by_state()?;
            if counts.pending == 0 {
                self.db
                    .set_setting(LAST_SYNC_AT_KEY, &Utc::now().to_rfc3339())?;
                log::info!("Drain complete, outbox empty");
            }
        }

        Ok(DrainOutcome::Completed(report))
    }

    /// Apply the conflict policy to a rejected push.
    #[allow(clippy::too_many_arguments)]
    async fn handle_conflict(
        &self,
        config: &SyncConfig,
        request: &PushRequest,
        entry_id: i64,
        remote_version: i64,
        remote_payload: Option<serde_json::Value>,
        report: &mut DrainReport,
        blocked: &mut HashSet<(EntityKind, String)>,
    ) -> Result<(), ProcessorError> {
        let ctx = ConflictContext {
            remote_version,
            remote_payload,
        };
        let key = (request.entity_kind, request.entity_id.clone());

        match conflict::resolve(config.conflict_resolution, &ctx) {
            ConflictDecision::AcceptLocal => {
                log::info!(
                    "Conflict on entry {}: overwriting remote (prefer_local)",
                    entry_id
                );
                let forced = PushRequest {
                    force: true,
                    ..request.clone()
                };
                match self.remote.push(&forced).await {
                    Ok(PushOutcome::Accepted { new_version }) => {
                        self.outbox.mark_synced(entry_id, new_version)?;
                        report.synced += 1;
                    }
                    Ok(PushOutcome::Rejected { reason }) => {
                        self.outbox.mark_permanent_failure(
                            entry_id,
                            &reason,
                            config.retry_ceiling,
                        )?;
                        report.permanent_failures += 1;
                    }
                    Ok(PushOutcome::Conflict { .. }) => {
                        // The remote refused a forced update; try again later.
                        self.record_transient_failure(
                            entry_id,
                            "forced update refused",
                            config,
                            key,
                            report,
                            blocked,
                        )?;
                    }
                    Err(e) => {
                        self.record_transient_failure(
                            entry_id,
                            &e.to_string(),
                            config,
                            key,
                            report,
                            blocked,
                        )?;
                    }
                }
            }
            ConflictDecision::AcceptRemote => {
                log::info!(
                    "Conflict on entry {}: pulling remote record (prefer_remote)",
                    entry_id
                );
                let payload = match ctx.remote_payload {
                    Some(payload) => Some(payload),
                    // 409 bodies may omit the record; fetch it.
                    None => match self
                        .remote
                        .fetch(request.entity_kind, &request.entity_id)
                        .await
                    {
                        Ok(record) => record.and_then(|r| r.payload),
                        Err(e) => {
                            self.record_transient_failure(
                                entry_id,
                                &e.to_string(),
                                config,
                                key,
                                report,
                                blocked,
                            )?;
                            return Ok(());
                        }
                    },
                };

                self.local_store.apply_remote_record(
                    request.entity_kind,
                    &request.entity_id,
                    payload.as_ref(),
                )?;
                self.outbox.mark_superseded(entry_id, remote_version)?;
                report.synced += 1;
            }
            ConflictDecision::DeferToUser => {
                self.outbox.mark_conflict(entry_id)?;
                report.conflicts += 1;
            }
        }

        Ok(())
    }

    fn record_transient_failure(
        &self,
        entry_id: i64,
        error: &str,
        config: &SyncConfig,
        key: (EntityKind, String),
        report: &mut DrainReport,
        blocked: &mut HashSet<(EntityKind, String)>,
    ) -> Result<(), ProcessorError> {
        self.outbox
            .mark_transient_failure(entry_id, error, config.retry_ceiling)?;
        report.transient_failures += 1;
        // Preserve per-entity ordering: no later entry for this entity may
        // overtake the failed one within this drain.
        blocked.insert(key);
        Ok(())
    }

    /// Apply the user's retroactive decision to a parked conflict entry.
    pub async fn resolve_conflict(
        &self,
        entry_id: i64,
        choice: ConflictChoice,
    ) -> Result<(), ProcessorError> {
        let entry = self.outbox.get_entry(entry_id)?;
        if entry.state != EntryState::Conflict {
            return Err(ProcessorError::NotInConflict(entry_id));
        }

        match choice {
            ConflictChoice::KeepLocal => {
                self.outbox.resolve_keep_local(entry_id)?;
                // Push the forced update right away; if a drain is already
                // running the entry goes out with it instead.
                let _ = self.drain(None).await?;
            }
            ConflictChoice::KeepRemote => {
                let record = self
                    .remote
                    .fetch(entry.entity_kind, &entry.entity_id)
                    .await?;
                let (version, payload) = match record {
                    Some(r) => (r.version, r.payload),
                    None => (entry.base_version, None),
                };
                self.local_store
                    .apply_remote_record(entry.entity_kind, &entry.entity_id, payload.as_ref())?;
                self.outbox.mark_superseded(entry_id, version)?;
            }
        }

        Ok(())
    }
}

/// Clears the draining flag when a drain leaves scope.
struct DrainGuard(Arc<AtomicBool>);

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================
