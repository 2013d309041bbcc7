//! Sync Module - Offline-First Cloud Synchronization
//!
//! Reconciles the local SQLite store with the Applitrack cloud API under
//! unreliable connectivity:
//! - Outbox: durable FIFO log of pending mutations, appended atomically
//!   with the entity mutation that caused them
//! - Processor: drains the outbox, one exclusive drain at a time
//! - Conflict policy: prefer-local / prefer-remote / ask-the-user
//! - Scheduler: periodic background drains
//! - Shutdown coordinator: bounded final drain before exit

pub mod api;
pub mod conflict;
pub mod models;
pub mod outbox;
pub mod processor;
pub mod scheduler;
pub mod shutdown;
pub mod status;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use api::{HttpRemote, PushOutcome, PushRequest, RemoteEndpoint, RemoteError, RemoteRecord};
pub use conflict::{ConflictChoice, ConflictContext, ConflictDecision, ConflictInfo};
pub use models::{
    ConflictResolution, ConnectionReport, EngineStatus, EntityKind, EntryState, NewOutboxEntry,
    Operation, OutboxEntry, SyncConfig, SyncConfigPatch, SyncSummary,
};
pub use outbox::{OutboxError, OutboxStore, StateCounts};
pub use processor::{DrainOutcome, DrainReport, LocalStore, ProcessorError, SyncProcessor};
pub use scheduler::{BackgroundScheduler, SchedulerError};
pub use shutdown::{CancelHandle, ShutdownCoordinator, ShutdownOutcome};
pub use status::StatusReporter;
