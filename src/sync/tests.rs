//! Integration Tests for the Sync Engine
//!
//! Cross-component tests for:
//! - Per-entity FIFO ordering under failures
//! - The conflict matrix (prefer_local / prefer_remote / ask)
//! - Retry ceiling and manual reset end to end
//! - Drain exclusivity under concurrent manual triggers
//! - Shutdown drain through the engine facade

#[cfg(test)]
mod integration_tests {
    use crate::db::{Database, DbError};
    use crate::sync::api::{PushOutcome, PushRequest, RemoteEndpoint, RemoteError, RemoteRecord};
    use crate::sync::conflict::ConflictChoice;
    use crate::sync::models::{
        ConflictResolution, EntityKind, EntryState, Operation, SyncConfigPatch,
    };
    use crate::sync::shutdown::ShutdownOutcome;
    use crate::sync::processor::LocalStore;
    use crate::{EngineError, SyncEngine};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    // ========================================================================
    // Test doubles
    // ========================================================================

    /// Remote whose next responses can be scripted; unscripted pushes are
    /// accepted with an incrementing version.
    struct ScriptedRemote {
        script: StdMutex<VecDeque<Result<PushOutcome, RemoteError>>>,
        pushes: StdMutex<Vec<PushRequest>>,
        version: AtomicI64,
        fetch_record: StdMutex<Option<RemoteRecord>>,
        push_delay_ms: u64,
        active_pushes: AtomicUsize,
        max_active_pushes: AtomicUsize,
    }

    impl ScriptedRemote {
        fn new() -> Self {
            Self {
                script: StdMutex::new(VecDeque::new()),
                pushes: StdMutex::new(Vec::new()),
                version: AtomicI64::new(0),
                fetch_record: StdMutex::new(None),
                push_delay_ms: 0,
                active_pushes: AtomicUsize::new(0),
                max_active_pushes: AtomicUsize::new(0),
            }
        }

        fn with_push_delay(ms: u64) -> Self {
            Self {
                push_delay_ms: ms,
                ..Self::new()
            }
        }

        fn script_next(&self, outcome: Result<PushOutcome, RemoteError>) {
            self.script.lock().unwrap().push_back(outcome);
        }

        fn set_fetch_record(&self, record: Option<RemoteRecord>) {
            *self.fetch_record.lock().unwrap() = record;
        }

        fn pushed_entities(&self) -> Vec<String> {
            self.pushes
                .lock()
                .unwrap()
                .iter()
                .map(|p| p.entity_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl RemoteEndpoint for ScriptedRemote {
        async fn push(&self, req: &PushRequest) -> Result<PushOutcome, RemoteError> {
            let active = self.active_pushes.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active_pushes.fetch_max(active, Ordering::SeqCst);

            if self.push_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.push_delay_ms)).await;
            }

            self.pushes.lock().unwrap().push(req.clone());
            let scripted = self.script.lock().unwrap().pop_front();
            self.active_pushes.fetch_sub(1, Ordering::SeqCst);

            match scripted {
                Some(outcome) => outcome,
                None => Ok(PushOutcome::Accepted {
                    new_version: self.version.fetch_add(1, Ordering::SeqCst) + 1,
                }),
            }
        }

        async fn fetch(
            &self,
            _entity_kind: EntityKind,
            _entity_id: &str,
        ) -> Result<Option<RemoteRecord>, RemoteError> {
            Ok(self.fetch_record.lock().unwrap().clone())
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    /// Records every remote record the engine applies locally.
    struct InMemoryLocalStore {
        applied: StdMutex<HashMap<(String, String), Option<Value>>>,
    }

    impl InMemoryLocalStore {
        fn new() -> Self {
            Self {
                applied: StdMutex::new(HashMap::new()),
            }
        }

        fn applied_payload(&self, entity_kind: &str, entity_id: &str) -> Option<Option<Value>> {
            self.applied
                .lock()
                .unwrap()
                .get(&(entity_kind.to_string(), entity_id.to_string()))
                .cloned()
        }
    }

    impl LocalStore for InMemoryLocalStore {
        fn apply_remote_record(
            &self,
            entity_kind: EntityKind,
            entity_id: &str,
            payload: Option<&Value>,
        ) -> Result<(), DbError> {
            self.applied.lock().unwrap().insert(
                (entity_kind.as_str().to_string(), entity_id.to_string()),
                payload.cloned(),
            );
            Ok(())
        }
    }

    fn create_engine(
        remote: Arc<ScriptedRemote>,
    ) -> (SyncEngine, Arc<InMemoryLocalStore>, Arc<Database>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let local_store = Arc::new(InMemoryLocalStore::new());
        let engine = SyncEngine::new(db.clone(), remote, local_store.clone()).unwrap();
        (engine, local_store, db)
    }

    /// Time-travel past every backoff deadline.
    fn clear_backoff(db: &Database) {
        db.execute("UPDATE sync_outbox SET next_retry_at = NULL", [])
            .unwrap();
    }

    fn set_conflict_mode(engine: &SyncEngine, mode: ConflictResolution) {
        engine
            .update_sync_config(SyncConfigPatch {
                conflict_resolution: Some(mode),
                ..Default::default()
            })
            .unwrap();
    }

    // ========================================================================
    // Ordering
    // ========================================================================

    #[tokio::test]
    async fn test_per_entity_fifo_survives_transient_failure() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, _local, db) = create_engine(remote.clone());

        // Two updates for contact c-1, one for the independent contact c-2.
        engine
            .enqueue(
                EntityKind::Contact,
                "c-1",
                Operation::Create,
                Some(json!({"name": "Alice"})),
            )
            .unwrap();
        engine
            .enqueue(
                EntityKind::Contact,
                "c-1",
                Operation::Update,
                Some(json!({"name": "Alice Smith"})),
            )
            .unwrap();
        engine
            .enqueue(
                EntityKind::Contact,
                "c-2",
                Operation::Create,
                Some(json!({"name": "Bob"})),
            )
            .unwrap();

        // First push for c-1 fails transiently.
        remote.script_next(Err(RemoteError::Server("502: bad gateway".to_string())));

        let summary = engine.trigger_manual_sync().await.unwrap();
        assert_eq!(summary.synced_count, 1);
        assert_eq!(summary.failed_count, 1);

        // The second c-1 entry never overtook the failed create; c-2
        // proceeded independently.
        assert_eq!(remote.pushed_entities(), vec!["c-1", "c-2"]);

        // Next drain replays c-1 in order.
        clear_backoff(&db);
        let summary = engine.trigger_manual_sync().await.unwrap();
        assert!(summary.success);
        assert_eq!(
            remote.pushed_entities(),
            vec!["c-1", "c-2", "c-1", "c-1"]
        );

        let pushes = remote.pushes.lock().unwrap();
        assert_eq!(pushes[2].operation, Operation::Create);
        assert_eq!(pushes[3].operation, Operation::Update);
    }

    #[tokio::test]
    async fn test_successful_drain_empties_outbox() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, _local, _db) = create_engine(remote);

        for i in 0..5 {
            engine
                .enqueue(
                    EntityKind::Application,
                    format!("a-{}", i),
                    Operation::Create,
                    Some(json!({"role": "Engineer"})),
                )
                .unwrap();
        }
        assert_eq!(engine.get_status().unwrap().pending_count, 5);

        let summary = engine.trigger_manual_sync().await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.synced_count, 5);

        let status = engine.get_status().unwrap();
        assert_eq!(status.pending_count, 0);
        assert!(status.last_sync_at.is_some());
    }

    // ========================================================================
    // Conflict matrix
    // ========================================================================

    #[tokio::test]
    async fn test_prefer_local_forces_local_payload_onto_remote() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, _local, _db) = create_engine(remote.clone());
        set_conflict_mode(&engine, ConflictResolution::PreferLocal);

        engine
            .enqueue(
                EntityKind::Company,
                "co-1",
                Operation::Update,
                Some(json!({"name": "Acme Corp"})),
            )
            .unwrap();

        remote.script_next(Ok(PushOutcome::Conflict {
            remote_version: 7,
            remote_payload: Some(json!({"name": "Acme Inc"})),
        }));

        let summary = engine.trigger_manual_sync().await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.synced_count, 1);

        let pushes = remote.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 2);
        assert!(!pushes[0].force);
        assert!(pushes[1].force);
        assert_eq!(pushes[1].payload, Some(json!({"name": "Acme Corp"})));

        assert_eq!(engine.get_status().unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn test_prefer_remote_applies_remote_payload_locally() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, local, db) = create_engine(remote.clone());
        set_conflict_mode(&engine, ConflictResolution::PreferRemote);

        let entry_id = engine
            .enqueue(
                EntityKind::Company,
                "co-1",
                Operation::Update,
                Some(json!({"name": "Acme Corp"})),
            )
            .unwrap();

        remote.script_next(Ok(PushOutcome::Conflict {
            remote_version: 7,
            remote_payload: Some(json!({"name": "Acme Inc"})),
        }));

        let summary = engine.trigger_manual_sync().await.unwrap();
        assert!(summary.success);

        // Local store received the remote record.
        assert_eq!(
            local.applied_payload("company", "co-1"),
            Some(Some(json!({"name": "Acme Inc"})))
        );

        // Entry is synced-as-superseded, remote version recorded.
        let outbox = crate::sync::outbox::OutboxStore::new(db);
        let entry = outbox.get_entry(entry_id).unwrap();
        assert_eq!(entry.state, EntryState::Synced);
        assert_eq!(entry.last_error.as_deref(), Some("superseded"));
        assert_eq!(
            outbox.remote_version(EntityKind::Company, "co-1").unwrap(),
            7
        );
        // Only the original push went out; nothing was forced.
        assert_eq!(remote.pushes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ask_parks_entry_until_user_decides() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, _local, db) = create_engine(remote.clone());
        // Default mode is Ask.

        let entry_id = engine
            .enqueue(
                EntityKind::Contact,
                "c-1",
                Operation::Update,
                Some(json!({"name": "Alice"})),
            )
            .unwrap();

        remote.script_next(Ok(PushOutcome::Conflict {
            remote_version: 3,
            remote_payload: Some(json!({"name": "Alicia"})),
        }));

        let summary = engine.trigger_manual_sync().await.unwrap();
        assert_eq!(summary.conflict_count, 1);

        let status = engine.get_status().unwrap();
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.conflict_count, 1);

        let conflicts = engine.list_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].entry_id, entry_id);

        // Further drains leave the parked entry alone.
        engine.trigger_manual_sync().await.unwrap();
        let outbox = crate::sync::outbox::OutboxStore::new(db);
        assert_eq!(outbox.get_entry(entry_id).unwrap().state, EntryState::Conflict);
        assert_eq!(remote.pushes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_conflict_keep_local_forces_push() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, _local, _db) = create_engine(remote.clone());

        let entry_id = engine
            .enqueue(
                EntityKind::Contact,
                "c-1",
                Operation::Update,
                Some(json!({"name": "Alice"})),
            )
            .unwrap();

        remote.script_next(Ok(PushOutcome::Conflict {
            remote_version: 3,
            remote_payload: None,
        }));
        engine.trigger_manual_sync().await.unwrap();
        assert_eq!(engine.get_status().unwrap().conflict_count, 1);

        engine
            .resolve_conflict(entry_id, ConflictChoice::KeepLocal)
            .await
            .unwrap();

        let status = engine.get_status().unwrap();
        assert_eq!(status.conflict_count, 0);
        assert_eq!(status.pending_count, 0);

        let pushes = remote.pushes.lock().unwrap();
        assert!(pushes.last().unwrap().force);
    }

    #[tokio::test]
    async fn test_resolve_conflict_keep_remote_pulls_record() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, local, _db) = create_engine(remote.clone());

        let entry_id = engine
            .enqueue(
                EntityKind::Contact,
                "c-1",
                Operation::Update,
                Some(json!({"name": "Alice"})),
            )
            .unwrap();

        remote.script_next(Ok(PushOutcome::Conflict {
            remote_version: 3,
            remote_payload: None,
        }));
        engine.trigger_manual_sync().await.unwrap();

        remote.set_fetch_record(Some(RemoteRecord {
            version: 4,
            payload: Some(json!({"name": "Alicia"})),
        }));

        engine
            .resolve_conflict(entry_id, ConflictChoice::KeepRemote)
            .await
            .unwrap();

        assert_eq!(
            local.applied_payload("contact", "c-1"),
            Some(Some(json!({"name": "Alicia"})))
        );
        let status = engine.get_status().unwrap();
        assert_eq!(status.conflict_count, 0);
        assert_eq!(status.pending_count, 0);
    }

    #[tokio::test]
    async fn test_resolve_conflict_rejects_non_conflict_entry() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, _local, _db) = create_engine(remote);

        let entry_id = engine
            .enqueue(
                EntityKind::Contact,
                "c-1",
                Operation::Update,
                Some(json!({"name": "Alice"})),
            )
            .unwrap();

        let result = engine
            .resolve_conflict(entry_id, ConflictChoice::KeepLocal)
            .await;
        assert!(matches!(result, Err(EngineError::Processor(_))));
    }

    // ========================================================================
    // Failures & retry ceiling
    // ========================================================================

    #[tokio::test]
    async fn test_permanent_rejection_is_not_retried() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, _local, db) = create_engine(remote.clone());

        engine
            .enqueue(
                EntityKind::Reminder,
                "r-1",
                Operation::Create,
                Some(json!({"note": ""})),
            )
            .unwrap();

        remote.script_next(Ok(PushOutcome::Rejected {
            reason: "note must not be empty".to_string(),
        }));

        let summary = engine.trigger_manual_sync().await.unwrap();
        assert!(!summary.success);
        assert_eq!(summary.failed_count, 1);

        let status = engine.get_status().unwrap();
        assert_eq!(status.failed_count, 1);
        assert_eq!(status.pending_count, 0);

        // No backoff ever makes it eligible again.
        clear_backoff(&db);
        engine.trigger_manual_sync().await.unwrap();
        assert_eq!(remote.pushes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_then_manual_reset() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, _local, db) = create_engine(remote.clone());

        engine
            .enqueue(
                EntityKind::Contact,
                "c-1",
                Operation::Update,
                Some(json!({"name": "Alice"})),
            )
            .unwrap();

        // Default ceiling is 3: exactly three transient failures.
        for _ in 0..3 {
            remote.script_next(Err(RemoteError::Server("500: boom".to_string())));
            clear_backoff(&db);
            engine.trigger_manual_sync().await.unwrap();
        }

        let status = engine.get_status().unwrap();
        assert_eq!(status.failed_count, 1);
        assert_eq!(status.pending_count, 0);

        // Excluded from automatic drains.
        clear_backoff(&db);
        engine.trigger_manual_sync().await.unwrap();
        assert_eq!(remote.pushes.lock().unwrap().len(), 3);

        // Manual reset restores it; the next drain delivers.
        assert_eq!(engine.retry_failed().unwrap(), 1);
        let summary = engine.trigger_manual_sync().await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.synced_count, 1);
        assert_eq!(engine.get_status().unwrap().failed_count, 0);
    }

    // ========================================================================
    // Drain exclusivity
    // ========================================================================

    #[tokio::test]
    async fn test_concurrent_manual_syncs_run_one_drain() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::with_push_delay(100));
        let (engine, _local, _db) = create_engine(remote.clone());

        for i in 0..3 {
            engine
                .enqueue(
                    EntityKind::Application,
                    format!("a-{}", i),
                    Operation::Create,
                    Some(json!({"role": "Engineer"})),
                )
                .unwrap();
        }

        let engine2 = engine.clone();
        let first = tokio::spawn(async move { engine2.trigger_manual_sync().await.unwrap() });

        // Let the first drain take the lock, then trigger a second.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let second = engine.trigger_manual_sync().await.unwrap();
        assert!(second.success);
        assert_eq!(second.synced_count, 0);

        let first = first.await.unwrap();
        assert_eq!(first.synced_count, 3);

        // Every entry was pushed exactly once, never concurrently.
        assert_eq!(remote.pushes.lock().unwrap().len(), 3);
        assert_eq!(remote.max_active_pushes.load(Ordering::SeqCst), 1);
    }

    // ========================================================================
    // Shutdown through the facade
    // ========================================================================

    #[tokio::test]
    async fn test_shutdown_sync_via_engine() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, _local, _db) = create_engine(remote);

        engine
            .enqueue(
                EntityKind::Reminder,
                "r-1",
                Operation::Create,
                Some(json!({"note": "follow up with recruiter"})),
            )
            .unwrap();

        let messages = Arc::new(StdMutex::new(Vec::new()));
        let sink = messages.clone();
        let outcome = engine
            .perform_shutdown_sync(move |m| sink.lock().unwrap().push(m))
            .await
            .unwrap();

        assert_eq!(outcome, ShutdownOutcome::ReadyToQuit);
        assert_eq!(engine.get_status().unwrap().pending_count, 0);
        assert!(!messages.lock().unwrap().is_empty());
    }

    // ========================================================================
    // Atomic enqueue through the facade
    // ========================================================================

    #[tokio::test]
    async fn test_enqueue_in_shares_repository_transaction() {
        init_logging();
        let remote = Arc::new(ScriptedRemote::new());
        let (engine, _local, db) = create_engine(remote);

        {
            let conn = db.get_conn().unwrap();
            conn.execute_batch("CREATE TABLE reminders (id TEXT PRIMARY KEY, note TEXT)")
                .unwrap();
        }

        // Committed: both the entity row and the outbox entry survive.
        {
            let mut conn = db.get_conn().unwrap();
            let tx = conn.transaction().unwrap();
            tx.execute(
                "INSERT INTO reminders (id, note) VALUES ('r-1', 'follow up')",
                [],
            )
            .unwrap();
            engine
                .enqueue_in(
                    &tx,
                    EntityKind::Reminder,
                    "r-1",
                    Operation::Create,
                    Some(json!({"note": "follow up"})),
                )
                .unwrap();
            tx.commit().unwrap();
        }
        assert_eq!(engine.get_status().unwrap().pending_count, 1);

        // Rolled back: neither write survives.
        {
            let mut conn = db.get_conn().unwrap();
            let tx = conn.transaction().unwrap();
            tx.execute(
                "INSERT INTO reminders (id, note) VALUES ('r-2', 'call back')",
                [],
            )
            .unwrap();
            engine
                .enqueue_in(
                    &tx,
                    EntityKind::Reminder,
                    "r-2",
                    Operation::Create,
                    Some(json!({"note": "call back"})),
                )
                .unwrap();
            tx.rollback().unwrap();
        }

        assert_eq!(engine.get_status().unwrap().pending_count, 1);
        let reminder_count: i64 = db
            .query_row("SELECT COUNT(*) FROM reminders", [], |row| row.get(0))
            .unwrap();
        assert_eq!(reminder_count, 1);
    }
}
