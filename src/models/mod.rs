mod patient;
mod pending;
mod resource;

pub use patient::{
    Gender, InvalidRegistration, PatientIdentifier, PatientRegistration, Person, PersonAddress,
    PersonAttribute, PersonName, RegistrationKind, Relationship, RelationshipSide,
};
pub use pending::{
    PendingRegistration, RegistrationId, SettleOutcome, SyncStatus, PAYLOAD_SCHEMA_VERSION,
};
pub use resource::ResourceKind;
