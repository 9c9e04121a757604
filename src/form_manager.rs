//! The two ways a registration form can be saved.

use std::sync::Arc;

use crate::db::{LocalFormStore, StoreError};
use crate::models::{PatientRegistration, RegistrationId};
use crate::sync::{Accepted, RemoteSubmitter, SubmitError};

/// Single decision point for how a save happens. The caller picks the path
/// from its own connectivity signal; nothing here checks the network.
#[derive(Clone)]
pub struct FormManager {
    store: LocalFormStore,
    submitter: Arc<dyn RemoteSubmitter>,
}

impl FormManager {
    pub fn new(store: LocalFormStore, submitter: Arc<dyn RemoteSubmitter>) -> Self {
        Self { store, submitter }
    }

    /// Submits straight to the server. Remote errors come back unchanged and
    /// nothing is queued.
    pub async fn save_online(
        &self,
        payload: &PatientRegistration,
    ) -> Result<Accepted, SubmitError> {
        let key = RegistrationId::new();
        tracing::debug!(%key, patient = %payload.patient_uuid, "saving registration online");
        self.submitter.submit(payload, key).await
    }

    /// Queues the registration for the next sync pass without touching the
    /// network.
    pub async fn save_offline(
        &self,
        payload: &PatientRegistration,
    ) -> Result<RegistrationId, StoreError> {
        self.store.enqueue(payload).await
    }
}
