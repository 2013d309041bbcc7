//! Shutdown Coordinator
//!
//! Makes the final window before process exit safe: drains the outbox to
//! empty (or to a user-accepted partial state) before the host is allowed
//! to terminate. Progress is streamed to the caller as human-readable
//! strings; cancellation is cooperative and lands between pushes, never
//! mid-push.

use super::processor::{DrainOutcome, ProcessorError, SyncProcessor};
use super::status::StatusReporter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Rounds without a single delivered entry before the attempt is declared
/// fatal (remote down or everything remaining is failing).
const MAX_STALLED_ROUNDS: u32 = 2;

/// Pause between drain rounds.
const ROUND_DELAY_MS: u64 = 500;

/// Verdict of a shutdown drain, consumed by the host's quit flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Outbox is empty (or was already); the host may terminate.
    ReadyToQuit,
    /// The user cancelled the quit; pending entries are intact.
    Cancelled,
    /// No forward progress is possible. The host offers close-anyway
    /// (entries stay queued for the next startup) or cancel-quit.
    Fatal { message: String },
}

/// Cooperative cancellation for an in-flight shutdown drain.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    processor: SyncProcessor,
    status: StatusReporter,
    cancel: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new(processor: SyncProcessor, status: StatusReporter) -> Self {
        Self {
            processor,
            status,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle the UI uses to cancel a running shutdown drain.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Drain-to-completion before exit.
    pub async fn run<F>(&self, mut on_progress: F) -> Result<ShutdownOutcome, ProcessorError>
    where
        F: FnMut(String),
    {
        // A previous, cancelled attempt must not poison this one.
        self.cancel.store(false, Ordering::SeqCst);

        let status = self.status.report()?;
        if status.pending_count == 0 {
            on_progress("All changes already synced.".to_string());
            return Ok(ShutdownOutcome::ReadyToQuit);
        }

        on_progress(format!(
            "Syncing {} pending change(s) before exit...",
            status.pending_count
        ));

        let mut stalled_rounds = 0u32;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                log::info!("Shutdown sync cancelled by user");
                on_progress("Sync cancelled.".to_string());
                return Ok(ShutdownOutcome::Cancelled);
            }

            match self.processor.drain(Some(&self.cancel)).await? {
                DrainOutcome::AlreadyRunning => {
                    // A manual or scheduled drain is mid-flight; let it
                    // finish and fold its result into the next round.
                    tokio::time::sleep(std::time::Duration::from_millis(ROUND_DELAY_MS)).await;
                    continue;
                }
                DrainOutcome::Completed(report) => {
                    if report.cancelled {
                        log::info!("Shutdown sync cancelled by user");
                        on_progress("Sync cancelled.".to_string());
                        return Ok(ShutdownOutcome::Cancelled);
                    }

                    let remaining = self.status.report()?.pending_count;
                    if remaining == 0 {
                        on_progress("All changes synced.".to_string());
                        return Ok(ShutdownOutcome::ReadyToQuit);
                    }

                    if report.synced == 0 {
                        stalled_rounds += 1;
                    } else {
                        stalled_rounds = 0;
                        on_progress(format!("{} change(s) remaining...", remaining));
                    }

                    if stalled_rounds >= MAX_STALLED_ROUNDS {
                        let message = if self.processor.probe().await {
                            format!(
                                "{} change(s) could not be synced; see the sync queue for details.",
                                remaining
                            )
                        } else {
                            "Sync server is unreachable.".to_string()
                        };
                        log::warn!("Shutdown sync gave up: {}", message);
                        on_progress(message.clone());
                        return Ok(ShutdownOutcome::Fatal { message });
                    }

                    tokio::time::sleep(std::time::Duration::from_millis(ROUND_DELAY_MS)).await;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
