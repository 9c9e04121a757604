//! Bootstraps the registration feature for a host shell.
//!
//! Everything the feature needs is built here and owned by
//! [`RegistrationFeature`]; there is no global queue. A host wires it up with
//!
//! ```no_run
//! # async fn host(config: patreg::config::Config) -> Result<(), Box<dyn std::error::Error>> {
//! let feature = patreg::RegistrationFeature::setup(&config).await?;
//! let on_reconnect = feature.sync_callback();
//! // host: connectivity.on_reconnect(move || on_reconnect());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::{init_db, LocalFormStore, ResourceCache, StoreError};
use crate::form_manager::FormManager;
use crate::models::{PatientRegistration, RegistrationId};
use crate::resources::OfflineResources;
use crate::sync::{
    Accepted, HttpSetupError, HttpSubmitter, RemoteSubmitter, SubmitError, SyncCoordinator,
    SyncSummary,
};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Could not open local database: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] HttpSetupError),
}

/// Stands in for the server when none is configured: every submission stays
/// queued.
struct NoRemote;

#[async_trait]
impl RemoteSubmitter for NoRemote {
    async fn submit(
        &self,
        _payload: &PatientRegistration,
        _idempotency_key: RegistrationId,
    ) -> Result<Accepted, SubmitError> {
        Err(SubmitError::Retryable(
            "no remote server configured".to_string(),
        ))
    }
}

pub struct RegistrationFeature {
    store: LocalFormStore,
    form_manager: FormManager,
    coordinator: SyncCoordinator,
    resources: OfflineResources,
}

impl RegistrationFeature {
    /// Opens the local database and connects the save and sync paths to the
    /// configured server.
    pub async fn setup(config: &Config) -> Result<Self, SetupError> {
        let pool = init_db(&config.database_path.value).await?;

        let remote = if config.remote.is_configured() {
            Some(HttpSubmitter::from_config(&config.remote)?)
        } else {
            tracing::warn!("no remote server configured; registrations will stay queued");
            None
        };
        let submitter: Arc<dyn RemoteSubmitter> = match &remote {
            Some(http) => Arc::new(http.clone()),
            None => Arc::new(NoRemote),
        };

        let store = LocalFormStore::new(pool.clone())
            .with_max_attempts(config.sync.max_attempts)
            .with_claim_lease(Duration::from_secs(config.sync.claim_lease_secs));

        Ok(Self::assemble(pool, store, submitter, remote).await?)
    }

    /// Builds the feature around an existing pool and submitter, with the
    /// default claim lease.
    pub async fn with_submitter(
        pool: SqlitePool,
        submitter: Arc<dyn RemoteSubmitter>,
        max_attempts: Option<u32>,
    ) -> Result<Self, StoreError> {
        let store = LocalFormStore::new(pool.clone()).with_max_attempts(max_attempts);
        Self::assemble(pool, store, submitter, None).await
    }

    async fn assemble(
        pool: SqlitePool,
        store: LocalFormStore,
        submitter: Arc<dyn RemoteSubmitter>,
        remote: Option<HttpSubmitter>,
    ) -> Result<Self, StoreError> {
        // Another process may be mid-pass on the same queue; only claims past
        // their lease are released.
        store.recover_in_flight().await?;

        Ok(Self {
            form_manager: FormManager::new(store.clone(), submitter.clone()),
            coordinator: SyncCoordinator::new(store.clone(), submitter),
            resources: OfflineResources::new(ResourceCache::new(pool), remote),
            store,
        })
    }

    pub fn store(&self) -> &LocalFormStore {
        &self.store
    }

    pub fn form_manager(&self) -> &FormManager {
        &self.form_manager
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn resources(&self) -> &OfflineResources {
        &self.resources
    }

    /// A callable for the host's reconnect hook. Each call runs a pass with
    /// its own cancellation token.
    pub fn sync_callback(
        &self,
    ) -> impl Fn() -> BoxFuture<'static, Option<SyncSummary>> + Send + Sync + 'static {
        let coordinator = self.coordinator.clone();
        move || -> BoxFuture<'static, Option<SyncSummary>> {
            let coordinator = coordinator.clone();
            Box::pin(async move { coordinator.run_sync(&CancellationToken::new()).await })
        }
    }

    /// Runs a pass every `interval` until `shutdown` fires. A pass in
    /// progress at shutdown stops after its current record.
    pub fn spawn_periodic_sync(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        coordinator.run_sync(&shutdown).await;
                    }
                }
            }
            tracing::debug!("periodic sync stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigSource, ConfigValue, RemoteConfig, SyncSettings};
    use crate::models::{Gender, PersonName, SyncStatus};
    use tempfile::TempDir;

    fn offline_config(dir: &TempDir) -> Config {
        Config {
            database_path: ConfigValue::new(dir.path().join("queue.db"), ConfigSource::Default),
            config_file: None,
            remote: RemoteConfig::default(),
            sync: SyncSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_setup_without_remote_keeps_records_queued() {
        let dir = TempDir::new().unwrap();
        let feature = RegistrationFeature::setup(&offline_config(&dir)).await.unwrap();
        let payload =
            PatientRegistration::new_patient(PersonName::new("Ada", "Okafor"), Gender::Female);

        let id = feature.form_manager().save_offline(&payload).await.unwrap();
        let summary = (feature.sync_callback())().await.unwrap();

        assert_eq!(summary.retried, 1);
        let record = feature.store().get(id).await.unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_setup_recovers_interrupted_submissions() {
        let dir = TempDir::new().unwrap();
        let mut config = offline_config(&dir);
        config.sync.claim_lease_secs = 0;
        let payload =
            PatientRegistration::new_patient(PersonName::new("Ada", "Okafor"), Gender::Female);

        let id = {
            let feature = RegistrationFeature::setup(&config).await.unwrap();
            let id = feature.store().enqueue(&payload).await.unwrap();
            feature.store().mark_in_flight(id).await.unwrap();
            id
        };

        let feature = RegistrationFeature::setup(&config).await.unwrap();
        let record = feature.store().get(id).await.unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_setup_leaves_live_claims_alone() {
        let dir = TempDir::new().unwrap();
        let config = offline_config(&dir);
        let payload =
            PatientRegistration::new_patient(PersonName::new("Ada", "Okafor"), Gender::Female);

        let running = RegistrationFeature::setup(&config).await.unwrap();
        let id = running.store().enqueue(&payload).await.unwrap();
        running.store().mark_in_flight(id).await.unwrap();

        let second = RegistrationFeature::setup(&config).await.unwrap();
        let record = second.store().get(id).await.unwrap().unwrap();
        assert_eq!(record.status, SyncStatus::InFlight);
    }

    #[tokio::test]
    async fn test_periodic_sync_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let feature = RegistrationFeature::setup(&offline_config(&dir)).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = feature.spawn_periodic_sync(Duration::from_millis(10), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        handle.await.unwrap();
        assert!(feature.coordinator().last_summary().is_some());
    }
}
