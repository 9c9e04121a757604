//! Shared fixtures for the integration tests.
//!
//! `MockSubmitter` records every submission and answers from a per-patient
//! script, falling back to `Accepted` once a script runs out.

#![allow(dead_code)]

use async_trait::async_trait;
use patreg::config::{Config, ConfigSource, ConfigValue, RemoteConfig, SyncSettings};
use patreg::db::init_db;
use patreg::models::{Gender, PatientRegistration, PersonName, RegistrationId};
use patreg::{Accepted, RegistrationFeature, RemoteSubmitter, SubmitError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// A recorded submit() call.
#[derive(Debug, Clone)]
pub struct SubmitCall {
    pub key: RegistrationId,
    pub given_name: String,
}

#[derive(Default)]
pub struct MockSubmitter {
    calls: Mutex<Vec<SubmitCall>>,
    /// given name -> answers, consumed front to back
    script: Mutex<HashMap<String, VecDeque<Result<(), SubmitError>>>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every submission takes at least `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queue an answer for the next submission of the patient named `given`.
    pub fn script(&self, given: &str, answer: Result<(), SubmitError>) {
        self.script
            .lock()
            .unwrap()
            .entry(given.to_string())
            .or_default()
            .push_back(answer);
    }

    pub fn calls(&self) -> Vec<SubmitCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn submitted_names(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.given_name).collect()
    }

    /// Highest number of submissions that were running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSubmitter for MockSubmitter {
    async fn submit(
        &self,
        payload: &PatientRegistration,
        idempotency_key: RegistrationId,
    ) -> Result<Accepted, SubmitError> {
        let given_name = payload.person.names[0].given_name.clone();
        self.calls.lock().unwrap().push(SubmitCall {
            key: idempotency_key,
            given_name: given_name.clone(),
        });

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let answer = self
            .script
            .lock()
            .unwrap()
            .get_mut(&given_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()));
        answer.map(|()| Accepted::new(payload.patient_uuid))
    }
}

pub fn patient(given: &str) -> PatientRegistration {
    PatientRegistration::new_patient(PersonName::new(given, "Test"), Gender::Unknown)
}

/// A feature over a fresh database in `dir`, wired to `submitter`.
pub async fn feature_with(
    dir: &TempDir,
    submitter: Arc<MockSubmitter>,
    max_attempts: Option<u32>,
) -> RegistrationFeature {
    let pool = init_db(&dir.path().join("queue.db")).await.unwrap();
    RegistrationFeature::with_submitter(pool, submitter, max_attempts)
        .await
        .unwrap()
}

/// Config pointing at a database in `dir` and, optionally, a server.
pub fn config_for(dir: &TempDir, base_url: Option<String>) -> Config {
    Config {
        database_path: ConfigValue::new(dir.path().join("queue.db"), ConfigSource::Default),
        config_file: None,
        remote: RemoteConfig {
            base_url,
            username: Some("admin".to_string()),
            password: Some("Admin123".to_string()),
            timeout_secs: 5,
        },
        sync: SyncSettings::default(),
    }
}
