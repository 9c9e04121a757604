use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::patient::PatientRegistration;

/// Current version of the persisted payload format.
pub const PAYLOAD_SCHEMA_VERSION: i64 = 1;

/// Client-generated identifier of a queued registration. Stable across
/// retries and sent to the server as the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrationId(Uuid);

impl RegistrationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RegistrationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RegistrationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RegistrationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    Pending,
    InFlight,
    Failed,
    /// Terminal; never persisted, the record is deleted instead.
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::InFlight => "in-flight",
            SyncStatus::Failed => "failed",
            SyncStatus::Synced => "synced",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "in-flight" => Ok(SyncStatus::InFlight),
            "failed" => Ok(SyncStatus::Failed),
            "synced" => Ok(SyncStatus::Synced),
            _ => Err(format!("Invalid sync status '{}'", s)),
        }
    }
}

/// One offline-captured registration waiting to reach the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRegistration {
    pub id: RegistrationId,
    pub payload: PatientRegistration,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: SyncStatus,
}

/// How a submission attempt ended, as reported to `LocalFormStore::settle`.
#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Accepted,
    RetryableFailure(String),
    PermanentFailure(String),
}

impl fmt::Display for PendingRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  {:<9}  {}  {} ({})",
            self.id,
            self.status,
            self.created_at.format("%Y-%m-%d %H:%M:%S"),
            self.payload.display_name(),
            self.payload.kind
        )?;
        if self.attempts > 0 {
            write!(f, "  attempts={}", self.attempts)?;
        }
        if let Some(err) = &self.last_error {
            write!(f, "  last_error=\"{}\"", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_uses_kebab_case() {
        assert_eq!(SyncStatus::InFlight.to_string(), "in-flight");
        assert_eq!(
            serde_json::to_string(&SyncStatus::InFlight).unwrap(),
            "\"in-flight\""
        );
        assert_eq!(SyncStatus::from_str("in-flight").unwrap(), SyncStatus::InFlight);
        assert!(SyncStatus::from_str("inflight").is_err());
    }

    #[test]
    fn test_registration_id_parses_uuid() {
        let id = RegistrationId::new();
        let parsed: RegistrationId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<RegistrationId>().is_err());
    }
}
