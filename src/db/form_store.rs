//! Durable queue of registrations captured while offline.
//!
//! Every state change is a single conditional statement, so the `status`
//! column doubles as the per-record in-flight guard: two passes racing for
//! the same record cannot both move it out of `pending`.
//!
//! A claim records when it was taken. Only claims older than the store's
//! lease are ever released, so a process starting up next to a running pass
//! leaves that pass's submissions alone.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use std::time::Duration;

use crate::models::{
    PatientRegistration, PendingRegistration, RegistrationId, SettleOutcome, SyncStatus,
    PAYLOAD_SCHEMA_VERSION,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Local storage unavailable: {0}")]
    StorageFailure(#[from] sqlx::Error),

    #[error("Could not encode registration: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Queued registration {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Registration {0} not found")]
    NotFound(RegistrationId),

    #[error("Registration {0} is already being submitted")]
    AlreadyInFlight(RegistrationId),

    #[error("Registration {0} is {1}, not pending")]
    NotPending(RegistrationId, SyncStatus),

    #[error("Registration {0} is {1}, not in flight")]
    NotInFlight(RegistrationId, SyncStatus),

    #[error("Registration {0} is {1}, not failed")]
    NotFailed(RegistrationId, SyncStatus),
}

impl StoreError {
    /// True when the device storage itself is the problem, as opposed to a
    /// record being in the wrong state.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            StoreError::StorageFailure(_) | StoreError::Encoding(_) | StoreError::Corrupt { .. }
        )
    }
}

/// Number of queued records per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_flight + self.failed
    }
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    id: String,
    payload: String,
    created_at: String,
    attempts: i64,
    last_error: Option<String>,
    status: String,
    schema_version: i64,
}

impl PendingRow {
    fn hydrate(self) -> Result<PendingRegistration, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };

        let id = self
            .id
            .parse::<RegistrationId>()
            .map_err(|e| corrupt(e.to_string()))?;
        let payload: PatientRegistration = match self.schema_version {
            PAYLOAD_SCHEMA_VERSION => {
                serde_json::from_str(&self.payload).map_err(|e| corrupt(e.to_string()))?
            }
            other => return Err(corrupt(format!("unsupported payload version {}", other))),
        };
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| corrupt(e.to_string()))?
            .with_timezone(&Utc);
        let status = self.status.parse::<SyncStatus>().map_err(corrupt)?;

        Ok(PendingRegistration {
            id,
            payload,
            created_at,
            attempts: self.attempts.max(0) as u32,
            last_error: self.last_error,
            status,
        })
    }
}

/// How long an in-flight claim is honoured before it counts as abandoned.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(15 * 60);

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

const SELECT_COLUMNS: &str =
    "SELECT id, payload, created_at, attempts, last_error, status, schema_version FROM pending_registrations";

/// Device-local store of registrations awaiting sync.
///
/// Cheap to clone; clones share the same connection pool.
#[derive(Clone)]
pub struct LocalFormStore {
    pool: SqlitePool,
    max_attempts: Option<u32>,
    claim_lease: Duration,
}

impl LocalFormStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_attempts: None,
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// Park records as `failed` once this many attempts have been made.
    /// `None` or `Some(0)` retries retryable failures forever.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts.filter(|&max| max > 0);
        self
    }

    /// Age after which an in-flight claim may be released by
    /// [`recover_in_flight`](Self::recover_in_flight). Must outlast the
    /// slowest submission.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn claim_lease(&self) -> Duration {
        self.claim_lease
    }

    /// Persists a new `pending` record and returns its fresh id.
    pub async fn enqueue(&self, payload: &PatientRegistration) -> Result<RegistrationId, StoreError> {
        let id = RegistrationId::new();
        let body = serde_json::to_string(payload)?;
        let created_at = now_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO pending_registrations (id, payload, created_at, attempts, status, schema_version)
            VALUES (?, ?, ?, 0, 'pending', ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&body)
        .bind(&created_at)
        .bind(PAYLOAD_SCHEMA_VERSION)
        .execute(&self.pool)
        .await?;

        tracing::info!(%id, patient = %payload.patient_uuid, kind = %payload.kind, "registration queued");
        Ok(id)
    }

    /// All non-terminal records, oldest first.
    ///
    /// Rows that can no longer be decoded are logged and left out. A sync pass
    /// reads the queue through [`scan`](Self::scan) instead, which keeps them
    /// in position.
    pub async fn list(&self) -> Result<Vec<PendingRegistration>, StoreError> {
        let mut records = Vec::new();
        for entry in self.scan().await? {
            match entry {
                Ok(record) => records.push(record),
                Err(e) => tracing::error!(error = %e, "skipping unreadable queued registration"),
            }
        }
        Ok(records)
    }

    /// Every record oldest first, with unreadable rows as `Corrupt` errors in
    /// their place in the order.
    pub async fn scan(&self) -> Result<Vec<Result<PendingRegistration, StoreError>>, StoreError> {
        let rows: Vec<PendingRow> =
            sqlx::query_as(&format!("{} ORDER BY created_at ASC, seq ASC", SELECT_COLUMNS))
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(PendingRow::hydrate).collect())
    }

    pub async fn get(&self, id: RegistrationId) -> Result<Option<PendingRegistration>, StoreError> {
        let row: Option<PendingRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(PendingRow::hydrate).transpose()
    }

    /// Claims a `pending` record for submission.
    pub async fn mark_in_flight(&self, id: RegistrationId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_registrations
            SET status = 'in-flight', claimed_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            tracing::debug!(%id, "registration in flight");
            return Ok(());
        }

        match self.status_of(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(SyncStatus::InFlight) => Err(StoreError::AlreadyInFlight(id)),
            Some(status) => Err(StoreError::NotPending(id, status)),
        }
    }

    /// Records the outcome of an in-flight submission and returns the status
    /// the record ended up in.
    pub async fn settle(
        &self,
        id: RegistrationId,
        outcome: &SettleOutcome,
    ) -> Result<SyncStatus, StoreError> {
        let settled = match outcome {
            SettleOutcome::Accepted => {
                let result = sqlx::query(
                    "DELETE FROM pending_registrations WHERE id = ? AND status = 'in-flight'",
                )
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
                (result.rows_affected() == 1).then_some(SyncStatus::Synced)
            }
            SettleOutcome::RetryableFailure(reason) => {
                let ceiling = self.max_attempts.map(i64::from);
                let status: Option<(String,)> = sqlx::query_as(
                    r#"
                    UPDATE pending_registrations
                    SET attempts = attempts + 1,
                        last_error = ?,
                        claimed_at = NULL,
                        status = CASE
                            WHEN ? IS NOT NULL AND attempts + 1 >= ? THEN 'failed'
                            ELSE 'pending'
                        END
                    WHERE id = ? AND status = 'in-flight'
                    RETURNING status
                    "#,
                )
                .bind(reason)
                .bind(ceiling)
                .bind(ceiling)
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
                status.map(|(s,)| {
                    s.parse::<SyncStatus>().unwrap_or(SyncStatus::Failed)
                })
            }
            SettleOutcome::PermanentFailure(reason) => {
                let result = sqlx::query(
                    r#"
                    UPDATE pending_registrations
                    SET attempts = attempts + 1, last_error = ?, status = 'failed', claimed_at = NULL
                    WHERE id = ? AND status = 'in-flight'
                    "#,
                )
                .bind(reason)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
                (result.rows_affected() == 1).then_some(SyncStatus::Failed)
            }
        };

        match settled {
            Some(status) => {
                tracing::debug!(%id, %status, "registration settled");
                Ok(status)
            }
            None => match self.status_of(id).await? {
                None => Err(StoreError::NotFound(id)),
                Some(status) => Err(StoreError::NotInFlight(id, status)),
            },
        }
    }

    /// Returns a parked `failed` record to the queue. Attempts are kept unless
    /// `reset_attempts` is set.
    pub async fn requeue(&self, id: RegistrationId, reset_attempts: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pending_registrations
            SET status = 'pending',
                attempts = CASE WHEN ? THEN 0 ELSE attempts END
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(reset_attempts)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            tracing::info!(%id, reset_attempts, "registration requeued");
            return Ok(());
        }

        match self.status_of(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(status) => Err(StoreError::NotFailed(id, status)),
        }
    }

    /// Drops a record that is not currently being submitted.
    pub async fn discard(&self, id: RegistrationId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "DELETE FROM pending_registrations WHERE id = ? AND status != 'in-flight'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            tracing::info!(%id, "registration discarded");
            return Ok(());
        }

        match self.status_of(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(_) => Err(StoreError::AlreadyInFlight(id)),
        }
    }

    /// Resets `in-flight` records whose claim is older than the lease, left
    /// behind by a process that died mid-submission or could not record an
    /// outcome. Younger claims belong to a pass that may still be running and
    /// are left alone.
    pub async fn recover_in_flight(&self) -> Result<u64, StoreError> {
        let cutoff = chrono::Duration::from_std(self.claim_lease)
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let result = sqlx::query(
            r#"
            UPDATE pending_registrations
            SET status = 'pending', claimed_at = NULL
            WHERE status = 'in-flight' AND (claimed_at IS NULL OR claimed_at <= ?)
            "#,
        )
        .bind(cutoff.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::warn!(recovered, "reset abandoned submissions to pending");
        }
        Ok(recovered)
    }

    pub async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM pending_registrations GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.parse::<SyncStatus>() {
                Ok(SyncStatus::Pending) => counts.pending = count,
                Ok(SyncStatus::InFlight) => counts.in_flight = count,
                Ok(SyncStatus::Failed) => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn status_of(&self, id: RegistrationId) -> Result<Option<SyncStatus>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM pending_registrations WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(status,)| {
            status.parse::<SyncStatus>().map_err(|reason| StoreError::Corrupt {
                id: id.to_string(),
                reason,
            })
        })
        .transpose()
    }
}
