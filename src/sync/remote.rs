//! Contract between the sync engine and the remote patient service.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{PatientRegistration, RegistrationId};

/// The server took the registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Uuid of the patient on the server.
    pub patient_uuid: Uuid,
    /// True when the server already had this registration from an earlier
    /// attempt whose response was lost.
    pub replayed: bool,
}

impl Accepted {
    pub fn new(patient_uuid: Uuid) -> Self {
        Self {
            patient_uuid,
            replayed: false,
        }
    }
}

/// Why a submission did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Network, timeout or server-side trouble; trying again later may work.
    #[error("Server unreachable or busy: {0}")]
    Retryable(String),

    /// The server refused the payload; only a person can fix it.
    #[error("Registration rejected: {0}")]
    Permanent(String),
}

impl SubmitError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::Retryable(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            SubmitError::Retryable(reason) | SubmitError::Permanent(reason) => reason,
        }
    }
}

/// Submits one registration to the remote service.
///
/// Implementations must treat `idempotency_key` as the identity of the
/// submission: the same key may arrive more than once after a lost response.
#[async_trait]
pub trait RemoteSubmitter: Send + Sync {
    async fn submit(
        &self,
        payload: &PatientRegistration,
        idempotency_key: RegistrationId,
    ) -> Result<Accepted, SubmitError>;
}
