use chrono::NaiveDate;
use clap::Args;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use super::OutputFormat;
use crate::models::{Gender, PatientIdentifier, PatientRegistration, PersonName};
use crate::RegistrationFeature;

/// Register a patient, or save an edit to one
#[derive(Args)]
pub struct RegisterCommand {
    /// Registration form as JSON (omit to build one from the flags below)
    #[arg(long, short = 'i', value_name = "FILE", conflicts_with_all = ["given", "family"])]
    input: Option<PathBuf>,

    /// Given name
    #[arg(long, required_unless_present = "input")]
    given: Option<String>,

    /// Family name
    #[arg(long, required_unless_present = "input")]
    family: Option<String>,

    /// Gender (male, female, other, unknown)
    #[arg(long, default_value = "unknown")]
    gender: String,

    /// Birthdate (YYYY-MM-DD)
    #[arg(long)]
    birthdate: Option<String>,

    /// Birthdate is an estimate
    #[arg(long)]
    estimated: bool,

    /// Identifier as TYPE=VALUE (can be repeated)
    #[arg(long = "identifier", value_name = "TYPE=VALUE")]
    identifiers: Vec<String>,

    /// Identifier generated on sync, as TYPE=SOURCE (can be repeated)
    #[arg(long = "generate", value_name = "TYPE=SOURCE")]
    generated: Vec<String>,

    /// Edit this existing patient instead of creating one
    #[arg(long, value_name = "UUID")]
    edit: Option<Uuid>,

    /// Queue for the next sync instead of submitting now
    #[arg(long)]
    offline: bool,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl RegisterCommand {
    pub async fn run(
        &self,
        feature: &RegistrationFeature,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let registration = self.build()?;
        registration.validate()?;

        let manager = feature.form_manager();
        if self.offline {
            let id = manager.save_offline(&registration).await?;
            match self.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({"queued": id, "patient_uuid": registration.patient_uuid})
                ),
                OutputFormat::Text => {
                    println!("Saved offline:");
                    print!("{}", registration);
                    println!("Queued as {}; it will be sent on the next sync.", id);
                }
            }
        } else {
            let accepted = manager.save_online(&registration).await?;
            match self.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({"patient_uuid": accepted.patient_uuid})
                ),
                OutputFormat::Text => {
                    println!("Registered:");
                    print!("{}", registration);
                }
            }
        }
        Ok(())
    }

    fn build(&self) -> Result<PatientRegistration, Box<dyn std::error::Error>> {
        if let Some(path) = &self.input {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
            let registration: PatientRegistration = serde_json::from_str(&contents)
                .map_err(|e| format!("Invalid registration form '{}': {}", path.display(), e))?;
            return Ok(registration);
        }

        let given = self.given.as_deref().unwrap_or_default().trim();
        let family = self.family.as_deref().unwrap_or_default().trim();
        let gender = Gender::from_str(&self.gender)?;
        let name = PersonName::new(given, family);

        let mut registration = match self.edit {
            Some(patient_uuid) => PatientRegistration::edit_patient(
                patient_uuid,
                PatientRegistration::new_patient(name, gender).person,
            ),
            None => PatientRegistration::new_patient(name, gender),
        };

        if let Some(birthdate) = &self.birthdate {
            let date = NaiveDate::parse_from_str(birthdate, "%Y-%m-%d").map_err(|_| {
                format!("Invalid birthdate '{}'. Use YYYY-MM-DD format.", birthdate)
            })?;
            registration = registration.with_birthdate(date, self.estimated);
        }

        for pair in &self.identifiers {
            let (identifier_type, value) = split_pair(pair)?;
            let preferred = registration.identifiers.is_empty();
            registration = registration.with_identifier(PatientIdentifier {
                identifier_type,
                identifier: Some(value),
                source: None,
                location: None,
                preferred,
            });
        }
        for pair in &self.generated {
            let (identifier_type, source) = split_pair(pair)?;
            let preferred = registration.identifiers.is_empty();
            registration = registration.with_identifier(PatientIdentifier {
                identifier_type,
                identifier: None,
                source: Some(source),
                location: None,
                preferred,
            });
        }

        Ok(registration)
    }
}

fn split_pair(pair: &str) -> Result<(String, String), String> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("Expected TYPE=VALUE, got '{}'", pair)),
    }
}
