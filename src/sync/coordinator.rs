//! Drains the offline registration queue against the remote server.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::remote::{RemoteSubmitter, SubmitError};
use crate::db::{LocalFormStore, StoreError};
use crate::models::{PendingRegistration, RegistrationId, SettleOutcome, SyncStatus};

/// A record that ended a pass parked as `failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub id: RegistrationId,
    pub patient_uuid: Uuid,
    pub patient_name: String,
    pub reason: String,
}

/// What one sync pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncSummary {
    /// Accepted by the server and removed from the queue.
    pub synced: usize,
    /// Retryable failures left pending for the next pass.
    pub retried: usize,
    /// Newly parked as failed during this pass.
    pub failed: usize,
    /// Claimed by another pass or gone before this one reached them.
    pub skipped: usize,
    /// Already parked as failed before the pass; not attempted.
    pub parked: usize,
    pub storage_errors: usize,
    /// Id of an unreadable record the pass stopped at, so that nothing
    /// captured after it overtakes it.
    pub blocked_by: Option<String>,
    /// The pass stopped early; unvisited records are untouched.
    pub cancelled: bool,
    pub failures: Vec<FailureReport>,
}

impl SyncSummary {
    pub fn attempted(&self) -> usize {
        self.synced + self.retried + self.failed
    }

    pub fn is_noop(&self) -> bool {
        self.attempted() == 0 && self.skipped == 0 && self.storage_errors == 0
    }
}

struct Inner {
    store: LocalFormStore,
    submitter: Arc<dyn RemoteSubmitter>,
    pass_lock: tokio::sync::Mutex<()>,
    trigger_queued: AtomicBool,
    last_summary: Mutex<Option<SyncSummary>>,
}

/// Clears the queued-trigger flag when the waiting trigger starts its pass or
/// is dropped while waiting.
struct QueuedTrigger<'a>(&'a AtomicBool);

impl Drop for QueuedTrigger<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs sync passes, one at a time.
///
/// Clones share the pass lock, so any clone may be handed to a host trigger.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(store: LocalFormStore, submitter: Arc<dyn RemoteSubmitter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                submitter,
                pass_lock: tokio::sync::Mutex::new(()),
                trigger_queued: AtomicBool::new(false),
                last_summary: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &LocalFormStore {
        &self.inner.store
    }

    /// Summary of the most recent completed or cancelled pass.
    pub fn last_summary(&self) -> Option<SyncSummary> {
        self.summary_slot().clone()
    }

    /// Runs one pass over the queue.
    ///
    /// A call made while a pass is running waits for it and then runs its own
    /// pass. If another call is already waiting, this one is coalesced into it
    /// and returns `None` immediately.
    pub async fn run_sync(&self, cancel: &CancellationToken) -> Option<SyncSummary> {
        if self.inner.trigger_queued.swap(true, Ordering::AcqRel) {
            tracing::debug!("sync pass already queued, coalescing trigger");
            return None;
        }

        let queued = QueuedTrigger(&self.inner.trigger_queued);
        let _pass = self.inner.pass_lock.lock().await;
        drop(queued);

        let summary = self.run_pass(cancel).await;
        *self.summary_slot() = Some(summary.clone());
        Some(summary)
    }

    async fn run_pass(&self, cancel: &CancellationToken) -> SyncSummary {
        let mut summary = SyncSummary::default();

        // Claims whose lease ran out were abandoned by a dead process or a
        // failed settle; put them back in line before reading the queue.
        if let Err(e) = self.inner.store.recover_in_flight().await {
            tracing::error!(error = %e, "could not release abandoned claims");
            summary.storage_errors += 1;
        }

        let entries = match self.inner.store.scan().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "could not read registration queue");
                summary.storage_errors += 1;
                return summary;
            }
        };

        tracing::info!(queued = entries.len(), "sync pass started");

        for entry in entries {
            if cancel.is_cancelled() {
                tracing::info!("sync pass cancelled");
                summary.cancelled = true;
                break;
            }
            match entry {
                Ok(record) => self.sync_record(record, &mut summary).await,
                Err(e) => {
                    tracing::error!(error = %e, "sync pass stopped at unreadable registration");
                    summary.storage_errors += 1;
                    summary.blocked_by = Some(match e {
                        StoreError::Corrupt { id, .. } => id,
                        other => other.to_string(),
                    });
                    break;
                }
            }
        }

        tracing::info!(
            synced = summary.synced,
            retried = summary.retried,
            failed = summary.failed,
            skipped = summary.skipped,
            parked = summary.parked,
            "sync pass finished"
        );
        summary
    }

    async fn sync_record(&self, record: PendingRegistration, summary: &mut SyncSummary) {
        let id = record.id;

        if record.status == SyncStatus::Failed {
            summary.parked += 1;
            return;
        }

        match self.inner.store.mark_in_flight(id).await {
            Ok(()) => {}
            Err(
                e @ (StoreError::AlreadyInFlight(_)
                | StoreError::NotFound(_)
                | StoreError::NotPending(..)),
            ) => {
                tracing::debug!(%id, reason = %e, "skipping registration");
                summary.skipped += 1;
                return;
            }
            Err(e) => {
                tracing::error!(%id, error = %e, "could not claim registration");
                summary.storage_errors += 1;
                return;
            }
        }

        let outcome = match self.inner.submitter.submit(&record.payload, id).await {
            Ok(accepted) => {
                tracing::info!(%id, patient = %accepted.patient_uuid, replayed = accepted.replayed, "registration synced");
                SettleOutcome::Accepted
            }
            Err(SubmitError::Retryable(reason)) => {
                tracing::warn!(%id, attempts = record.attempts + 1, error = %reason, "registration still pending");
                SettleOutcome::RetryableFailure(reason)
            }
            Err(SubmitError::Permanent(reason)) => {
                tracing::warn!(%id, error = %reason, "registration rejected, needs manual resolution");
                SettleOutcome::PermanentFailure(reason)
            }
        };

        let settled = match self.inner.store.settle(id, &outcome).await {
            Err(e) if e.is_storage_failure() => {
                tracing::warn!(%id, error = %e, "retrying sync outcome write");
                self.inner.store.settle(id, &outcome).await
            }
            settled => settled,
        };

        match settled {
            Ok(SyncStatus::Synced) => summary.synced += 1,
            Ok(SyncStatus::Failed) => {
                let reason = match outcome {
                    SettleOutcome::RetryableFailure(reason)
                    | SettleOutcome::PermanentFailure(reason) => reason,
                    SettleOutcome::Accepted => String::new(),
                };
                summary.failed += 1;
                summary.failures.push(FailureReport {
                    id,
                    patient_uuid: record.payload.patient_uuid,
                    patient_name: record.payload.display_name(),
                    reason,
                });
            }
            Ok(_) => summary.retried += 1,
            Err(e) => {
                // Left in flight until its claim lease runs out.
                tracing::error!(%id, error = %e, "could not record sync outcome");
                summary.storage_errors += 1;
            }
        }
    }

    fn summary_slot(&self) -> MutexGuard<'_, Option<SyncSummary>> {
        self.inner
            .last_summary
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
