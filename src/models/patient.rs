use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Whether a registration creates a new patient or edits an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationKind {
    Create,
    Edit,
}

impl fmt::Display for RegistrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationKind::Create => write!(f, "create"),
            RegistrationKind::Edit => write!(f, "edit"),
        }
    }
}

/// Administrative gender as the patient server encodes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[serde(rename = "O")]
    Other,
    #[serde(rename = "U")]
    Unknown,
}

impl Gender {
    pub fn code(&self) -> &'static str {
        match self {
            Gender::Male => "M",
            Gender::Female => "F",
            Gender::Other => "O",
            Gender::Unknown => "U",
        }
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "m" | "male" => Ok(Gender::Male),
            "f" | "female" => Ok(Gender::Female),
            "o" | "other" => Ok(Gender::Other),
            "u" | "unknown" => Ok(Gender::Unknown),
            _ => Err(format!(
                "Invalid gender '{}'. Valid options: male, female, other, unknown",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonName {
    pub given_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    pub family_name: String,
    #[serde(default)]
    pub preferred: bool,
}

impl PersonName {
    pub fn new(given_name: impl Into<String>, family_name: impl Into<String>) -> Self {
        Self {
            given_name: given_name.into(),
            middle_name: None,
            family_name: family_name.into(),
            preferred: true,
        }
    }
}

/// Free-form address; field names follow the server's address template
/// (`address1`, `cityVillage`, `country`, ...).
pub type PersonAddress = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonAttribute {
    pub attribute_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub names: Vec<PersonName>,
    pub gender: Gender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<NaiveDate>,
    #[serde(default)]
    pub birthdate_estimated: bool,
    #[serde(default)]
    pub addresses: Vec<PersonAddress>,
    #[serde(default)]
    pub attributes: Vec<PersonAttribute>,
}

/// A patient identifier. When `identifier` is empty and `source` is set, the
/// value is generated by the server's identifier source at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientIdentifier {
    pub identifier_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub preferred: bool,
}

impl PatientIdentifier {
    pub fn needs_generation(&self) -> bool {
        self.identifier.as_deref().map_or(true, str::is_empty) && self.source.is_some()
    }
}

/// Which side of the relationship the registered patient is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipSide {
    A,
    B,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_type: String,
    pub related_person: String,
    pub side: RelationshipSide,
}

/// The patient record plus identifiers and relationships, as captured by the
/// registration form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRegistration {
    pub patient_uuid: Uuid,
    pub kind: RegistrationKind,
    pub person: Person,
    #[serde(default)]
    pub identifiers: Vec<PatientIdentifier>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_by: Option<String>,
}

impl PatientRegistration {
    /// A new patient with a client-generated uuid.
    pub fn new_patient(name: PersonName, gender: Gender) -> Self {
        Self {
            patient_uuid: Uuid::new_v4(),
            kind: RegistrationKind::Create,
            person: Person {
                names: vec![name],
                gender,
                birthdate: None,
                birthdate_estimated: false,
                addresses: Vec::new(),
                attributes: Vec::new(),
            },
            identifiers: Vec::new(),
            relationships: Vec::new(),
            location_uuid: None,
            captured_by: None,
        }
    }

    /// An edit of an already registered patient.
    pub fn edit_patient(patient_uuid: Uuid, person: Person) -> Self {
        Self {
            patient_uuid,
            kind: RegistrationKind::Edit,
            person,
            identifiers: Vec::new(),
            relationships: Vec::new(),
            location_uuid: None,
            captured_by: None,
        }
    }

    pub fn with_birthdate(mut self, birthdate: NaiveDate, estimated: bool) -> Self {
        self.person.birthdate = Some(birthdate);
        self.person.birthdate_estimated = estimated;
        self
    }

    pub fn with_identifier(mut self, identifier: PatientIdentifier) -> Self {
        self.identifiers.push(identifier);
        self
    }

    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn with_location(mut self, location_uuid: impl Into<String>) -> Self {
        self.location_uuid = Some(location_uuid.into());
        self
    }

    /// Display name of the preferred (or first) name.
    pub fn display_name(&self) -> String {
        let name = self
            .person
            .names
            .iter()
            .find(|n| n.preferred)
            .or_else(|| self.person.names.first());
        match name {
            Some(n) => format!("{} {}", n.given_name, n.family_name),
            None => "(unnamed)".to_string(),
        }
    }

    /// Checks the fields the server will reject outright.
    pub fn validate(&self) -> Result<(), InvalidRegistration> {
        if self.person.names.is_empty() {
            return Err(InvalidRegistration::MissingName);
        }
        for name in &self.person.names {
            if name.given_name.trim().is_empty() || name.family_name.trim().is_empty() {
                return Err(InvalidRegistration::BlankName);
            }
        }
        for id in &self.identifiers {
            let has_value = id.identifier.as_deref().is_some_and(|v| !v.trim().is_empty());
            if !has_value && id.source.is_none() {
                return Err(InvalidRegistration::EmptyIdentifier(id.identifier_type.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidRegistration {
    #[error("Patient must have at least one name")]
    MissingName,
    #[error("Given and family name must not be blank")]
    BlankName,
    #[error("Identifier of type {0} has no value and no identifier source")]
    EmptyIdentifier(String),
}

impl fmt::Display for PatientRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Patient: {} ({})", self.display_name(), self.kind)?;
        writeln!(f, "  uuid:   {}", self.patient_uuid)?;
        writeln!(f, "  gender: {}", self.person.gender.code())?;
        if let Some(birthdate) = self.person.birthdate {
            let marker = if self.person.birthdate_estimated { " (estimated)" } else { "" };
            writeln!(f, "  born:   {}{}", birthdate, marker)?;
        }
        for id in &self.identifiers {
            match &id.identifier {
                Some(value) => writeln!(f, "  identifier: {}", value)?,
                None => writeln!(f, "  identifier: (generated on sync)")?,
            }
        }
        Ok(())
    }
}
