//! `RemoteSubmitter` over the OpenMRS REST API.
//!
//! A registration becomes up to four kinds of request: identifier generation
//! for identifiers captured without a value, the patient create (or person
//! update for edits), and one request per relationship.
//!
//! Only the patient create is atomic on the server, so a retry first reads
//! back the identifiers and relationships an earlier attempt left behind and
//! posts just the rest.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

use super::remote::{Accepted, RemoteSubmitter, SubmitError};
use crate::config::RemoteConfig;
use crate::models::{
    PatientIdentifier, PatientRegistration, RegistrationId, RegistrationKind, Relationship,
    RelationshipSide,
};

/// Header carrying the queued record id on every write.
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

const REST_PREFIX: &str = "/ws/rest/v1";

#[derive(Debug, thiserror::Error)]
pub enum HttpSetupError {
    #[error("Remote server not configured. Add remote.base_url to config or set PATREG_SERVER_URL.")]
    NotConfigured,

    #[error("Could not build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// HTTP client for the patient registration endpoints.
#[derive(Clone)]
pub struct HttpSubmitter {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpSubmitter {
    pub fn from_config(config: &RemoteConfig) -> Result<Self, HttpSetupError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or(HttpSetupError::NotConfigured)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds an authenticated request for a path below the server root.
    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    /// GETs a JSON document, with the same outcome classes as a submission.
    pub async fn get_json(&self, path: &str) -> Result<Value, SubmitError> {
        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(response).await
    }

    async fn send_write(
        &self,
        path: &str,
        body: &Value,
        key: RegistrationId,
    ) -> Result<Response, SubmitError> {
        self.request(Method::POST, path)
            .header(IDEMPOTENCY_HEADER, key.to_string())
            .json(body)
            .send()
            .await
            .map_err(transport_error)
    }

    /// Fills in identifiers that were captured offline without a value.
    async fn resolve_identifiers(
        &self,
        identifiers: &[PatientIdentifier],
        key: RegistrationId,
    ) -> Result<Vec<PatientIdentifier>, SubmitError> {
        let mut resolved = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            let mut identifier = identifier.clone();
            if identifier.needs_generation() {
                if let Some(source) = identifier.source.as_deref() {
                    identifier.identifier = Some(self.generate_identifier(source, key).await?);
                }
            }
            resolved.push(identifier);
        }
        Ok(resolved)
    }

    async fn generate_identifier(
        &self,
        source: &str,
        key: RegistrationId,
    ) -> Result<String, SubmitError> {
        let path = format!("{}/idgen/identifiersource/{}/identifier", REST_PREFIX, source);
        let response = self.send_write(&path, &json!({}), key).await?;
        let body = expect_success(response).await?;

        body.get("identifier")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                SubmitError::Retryable(format!(
                    "identifier source {} returned no identifier",
                    source
                ))
            })
    }

    async fn create_patient(
        &self,
        payload: &PatientRegistration,
        identifiers: &[PatientIdentifier],
        key: RegistrationId,
    ) -> Result<Accepted, SubmitError> {
        let body = json!({
            "uuid": payload.patient_uuid,
            "person": person_body(payload),
            "identifiers": identifiers.iter().map(|i| identifier_body(i, payload)).collect::<Vec<_>>(),
        });

        let response = self
            .send_write(&format!("{}/patient", REST_PREFIX), &body, key)
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(Accepted::new(payload.patient_uuid));
        }

        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::CONFLICT {
            // An earlier attempt may have landed before its response was lost.
            if self.patient_exists(payload.patient_uuid).await? {
                tracing::info!(%key, patient = %payload.patient_uuid, "patient already on server, treating as accepted");
                return Ok(Accepted {
                    patient_uuid: payload.patient_uuid,
                    replayed: true,
                });
            }
            return Err(SubmitError::Permanent(describe(status, &text)));
        }
        Err(classify_status(status, &text))
    }

    async fn update_patient(
        &self,
        payload: &PatientRegistration,
        key: RegistrationId,
    ) -> Result<Accepted, SubmitError> {
        let path = format!("{}/person/{}", REST_PREFIX, payload.patient_uuid);
        let response = self.send_write(&path, &person_body(payload), key).await?;
        expect_success(response).await?;

        if payload.identifiers.is_empty() {
            return Ok(Accepted::new(payload.patient_uuid));
        }

        // A retried edit finds whatever an earlier attempt already added.
        let recorded = self.recorded_identifiers(payload.patient_uuid).await?;
        let missing: Vec<PatientIdentifier> = payload
            .identifiers
            .iter()
            .filter(|i| !is_recorded(i, &recorded))
            .cloned()
            .collect();
        let identifiers = self.resolve_identifiers(&missing, key).await?;

        let path = format!("{}/patient/{}/identifier", REST_PREFIX, payload.patient_uuid);
        for identifier in &identifiers {
            let response = self
                .send_write(&path, &identifier_body(identifier, payload), key)
                .await?;
            expect_success(response).await?;
        }

        Ok(Accepted::new(payload.patient_uuid))
    }

    /// (identifier type, value) pairs the server holds for a patient.
    async fn recorded_identifiers(
        &self,
        patient_uuid: Uuid,
    ) -> Result<Vec<(String, String)>, SubmitError> {
        let path = format!(
            "{}/patient/{}/identifier?v=custom:(identifier,identifierType:(uuid))",
            REST_PREFIX, patient_uuid
        );
        let body = self.get_json(&path).await?;
        Ok(results(&body)
            .filter_map(|r| {
                let kind = r.pointer("/identifierType/uuid")?.as_str()?;
                let value = r.get("identifier")?.as_str()?;
                Some((kind.to_string(), value.to_string()))
            })
            .collect())
    }

    async fn recorded_relationships(
        &self,
        patient_uuid: Uuid,
    ) -> Result<HashSet<RelationshipKey>, SubmitError> {
        let path = format!(
            "{}/relationship?person={}&v=custom:(personA:(uuid),personB:(uuid),relationshipType:(uuid))",
            REST_PREFIX, patient_uuid
        );
        let body = self.get_json(&path).await?;
        Ok(results(&body)
            .filter_map(|r| {
                Some((
                    r.pointer("/personA/uuid")?.as_str()?.to_string(),
                    r.pointer("/personB/uuid")?.as_str()?.to_string(),
                    r.pointer("/relationshipType/uuid")?.as_str()?.to_string(),
                ))
            })
            .collect())
    }

    async fn create_relationship(
        &self,
        (person_a, person_b, relationship_type): &RelationshipKey,
        key: RegistrationId,
    ) -> Result<(), SubmitError> {
        let body = json!({
            "personA": person_a,
            "personB": person_b,
            "relationshipType": relationship_type,
        });

        let response = self
            .send_write(&format!("{}/relationship", REST_PREFIX), &body, key)
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    async fn patient_exists(&self, patient_uuid: Uuid) -> Result<bool, SubmitError> {
        let path = format!("{}/patient/{}?v=custom:(uuid)", REST_PREFIX, patient_uuid);
        let response = self
            .request(Method::GET, &path)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let text = response.text().await.unwrap_or_default();
                // Unknown whether the first attempt landed; ask again next pass.
                Err(SubmitError::Retryable(describe(status, &text)))
            }
        }
    }
}

#[async_trait]
impl RemoteSubmitter for HttpSubmitter {
    async fn submit(
        &self,
        payload: &PatientRegistration,
        idempotency_key: RegistrationId,
    ) -> Result<Accepted, SubmitError> {
        let accepted = match payload.kind {
            RegistrationKind::Create => {
                let identifiers = self
                    .resolve_identifiers(&payload.identifiers, idempotency_key)
                    .await?;
                self.create_patient(payload, &identifiers, idempotency_key)
                    .await?
            }
            RegistrationKind::Edit => self.update_patient(payload, idempotency_key).await?,
        };

        if !payload.relationships.is_empty() {
            // Relationships from an earlier, interrupted attempt are not posted again.
            let recorded = self.recorded_relationships(payload.patient_uuid).await?;
            for relationship in &payload.relationships {
                let ends = relationship_key(payload.patient_uuid, relationship);
                if recorded.contains(&ends) {
                    tracing::debug!(key = %idempotency_key, relationship_type = ends.2.as_str(), "relationship already on server");
                    continue;
                }
                self.create_relationship(&ends, idempotency_key).await?;
            }
        }

        tracing::debug!(key = %idempotency_key, patient = %accepted.patient_uuid, "registration submitted");
        Ok(accepted)
    }
}

/// personA, personB and relationship type uuids.
type RelationshipKey = (String, String, String);

fn relationship_key(patient_uuid: Uuid, relationship: &Relationship) -> RelationshipKey {
    let patient = patient_uuid.to_string();
    let related = relationship.related_person.clone();
    let (person_a, person_b) = match relationship.side {
        RelationshipSide::A => (patient, related),
        RelationshipSide::B => (related, patient),
    };
    (person_a, person_b, relationship.relationship_type.clone())
}

/// An identifier without a value counts as recorded once its type is.
fn is_recorded(identifier: &PatientIdentifier, recorded: &[(String, String)]) -> bool {
    recorded.iter().any(|(kind, value)| {
        *kind == identifier.identifier_type
            && identifier.identifier.as_ref().map_or(true, |v| v == value)
    })
}

fn results(body: &Value) -> impl Iterator<Item = &Value> {
    body.get("results")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn person_body(payload: &PatientRegistration) -> Value {
    let person = &payload.person;
    let names: Vec<Value> = person
        .names
        .iter()
        .map(|n| {
            json!({
                "givenName": n.given_name,
                "middleName": n.middle_name,
                "familyName": n.family_name,
                "preferred": n.preferred,
            })
        })
        .collect();
    let addresses: Vec<Value> = person
        .addresses
        .iter()
        .enumerate()
        .map(|(i, address)| {
            let mut value = json!(address);
            value["preferred"] = json!(i == 0);
            value
        })
        .collect();
    let attributes: Vec<Value> = person
        .attributes
        .iter()
        .map(|a| json!({"attributeType": a.attribute_type, "value": a.value}))
        .collect();

    let mut body = json!({
        "names": names,
        "gender": person.gender.code(),
        "birthdateEstimated": person.birthdate_estimated,
        "addresses": addresses,
        "attributes": attributes,
    });
    if let Some(birthdate) = person.birthdate {
        body["birthdate"] = json!(birthdate.to_string());
    }
    if payload.kind == RegistrationKind::Create {
        body["uuid"] = json!(payload.patient_uuid);
    }
    body
}

fn identifier_body(identifier: &PatientIdentifier, payload: &PatientRegistration) -> Value {
    json!({
        "identifier": identifier.identifier,
        "identifierType": identifier.identifier_type,
        "location": identifier.location.as_ref().or(payload.location_uuid.as_ref()),
        "preferred": identifier.preferred,
    })
}

/// Maps a transport failure. Everything except a malformed request is worth
/// another try once connectivity returns.
fn transport_error(e: reqwest::Error) -> SubmitError {
    if e.is_builder() {
        SubmitError::Permanent(format!("invalid request: {}", e))
    } else if e.is_timeout() {
        SubmitError::Retryable(format!("timed out: {}", e))
    } else {
        SubmitError::Retryable(e.to_string())
    }
}

/// Maps a non-success HTTP status to the two outcome classes.
pub fn classify_status(status: StatusCode, body: &str) -> SubmitError {
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::UNAUTHORIZED;

    if retryable {
        SubmitError::Retryable(describe(status, body))
    } else {
        SubmitError::Permanent(describe(status, body))
    }
}

async fn expect_success(response: Response) -> Result<Value, SubmitError> {
    let status = response.status();
    let text = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(classify_status(status, &text));
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|e| SubmitError::Retryable(format!("unreadable response: {}", e)))
}

/// Short human-readable reason, preferring the server's own error message.
fn describe(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        v.pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    match message {
        Some(message) => format!("HTTP {}: {}", status.as_u16(), message),
        None if body.trim().is_empty() => format!("HTTP {}", status.as_u16()),
        None => {
            let excerpt: String = body.chars().take(200).collect();
            format!("HTTP {}: {}", status.as_u16(), excerpt.trim())
        }
    }
}
