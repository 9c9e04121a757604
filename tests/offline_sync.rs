//! End-to-end offline capture and sync through `RegistrationFeature`.

mod common;

use common::{feature_with, patient, MockSubmitter};
use patreg::db::init_db;
use patreg::models::{PatientRegistration, SyncStatus};
use patreg::{RegistrationFeature, SubmitError, SyncCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn offline_registration_syncs_after_reconnect() {
    let dir = TempDir::new().unwrap();
    let submitter = Arc::new(MockSubmitter::new());
    let feature = feature_with(&dir, submitter.clone(), None).await;

    let a1 = feature
        .form_manager()
        .save_offline(&patient("Alice"))
        .await
        .unwrap();
    assert!(submitter.calls().is_empty());

    let on_reconnect = feature.sync_callback();
    let summary = on_reconnect().await.unwrap();

    assert_eq!(summary.synced, 1);
    assert!(feature.store().list().await.unwrap().is_empty());
    assert_eq!(submitter.calls()[0].key, a1);
}

#[tokio::test]
async fn timed_out_registration_is_retried_on_next_pass() {
    let dir = TempDir::new().unwrap();
    let submitter = Arc::new(MockSubmitter::new());
    submitter.script("Bob", Err(SubmitError::Retryable("timed out".to_string())));
    let feature = feature_with(&dir, submitter.clone(), None).await;

    let b1 = feature
        .form_manager()
        .save_offline(&patient("Bob"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let first = feature.coordinator().run_sync(&cancel).await.unwrap();
    assert_eq!(first.retried, 1);

    let record = feature.store().get(b1).await.unwrap().unwrap();
    assert_eq!(record.status, SyncStatus::Pending);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.last_error.as_deref(), Some("timed out"));

    let second = feature.coordinator().run_sync(&cancel).await.unwrap();
    assert_eq!(second.synced, 1);
    assert!(feature.store().get(b1).await.unwrap().is_none());

    // Both attempts carried the same key.
    let calls = submitter.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.key == b1));
}

#[tokio::test]
async fn creation_is_attempted_before_later_edit() {
    let dir = TempDir::new().unwrap();
    let submitter = Arc::new(MockSubmitter::new());
    let feature = feature_with(&dir, submitter.clone(), None).await;

    let created = patient("Alice");
    let mut edited = PatientRegistration::edit_patient(created.patient_uuid, created.person.clone());
    edited.person.names[0].given_name = "Alicia".to_string();

    let a1 = feature.form_manager().save_offline(&created).await.unwrap();
    let a2 = feature.form_manager().save_offline(&edited).await.unwrap();

    let summary = feature
        .coordinator()
        .run_sync(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.synced, 2);
    let keys: Vec<_> = submitter.calls().into_iter().map(|c| c.key).collect();
    assert_eq!(keys, vec![a1, a2]);
}

#[tokio::test]
async fn draining_twice_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let submitter = Arc::new(MockSubmitter::new());
    let feature = feature_with(&dir, submitter.clone(), None).await;

    for name in ["Alice", "Bob", "Carol"] {
        feature.form_manager().save_offline(&patient(name)).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let first = feature.coordinator().run_sync(&cancel).await.unwrap();
    let second = feature.coordinator().run_sync(&cancel).await.unwrap();

    assert_eq!(first.synced, 3);
    assert!(second.is_noop());
    assert_eq!(submitter.submitted_names(), vec!["Alice", "Bob", "Carol"]);
}

#[tokio::test]
async fn rejected_registration_is_parked_until_requeued() {
    let dir = TempDir::new().unwrap();
    let submitter = Arc::new(MockSubmitter::new());
    submitter.script(
        "Dan",
        Err(SubmitError::Permanent("HTTP 400: identifier in use".to_string())),
    );
    let feature = feature_with(&dir, submitter.clone(), None).await;

    let id = feature
        .form_manager()
        .save_offline(&patient("Dan"))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let first = feature.coordinator().run_sync(&cancel).await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.failures[0].id, id);
    assert_eq!(first.failures[0].patient_name, "Dan Test");

    let second = feature.coordinator().run_sync(&cancel).await.unwrap();
    assert_eq!(second.parked, 1);
    assert_eq!(submitter.calls().len(), 1);

    feature.store().requeue(id, false).await.unwrap();
    let third = feature.coordinator().run_sync(&cancel).await.unwrap();
    assert_eq!(third.synced, 1);
    assert_eq!(submitter.calls().len(), 2);
}

#[tokio::test]
async fn attempt_ceiling_parks_record() {
    let dir = TempDir::new().unwrap();
    let submitter = Arc::new(MockSubmitter::new());
    for _ in 0..3 {
        submitter.script("Eve", Err(SubmitError::Retryable("HTTP 503".to_string())));
    }
    let feature = feature_with(&dir, submitter.clone(), Some(2)).await;

    let id = feature
        .form_manager()
        .save_offline(&patient("Eve"))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    feature.coordinator().run_sync(&cancel).await.unwrap();
    let summary = feature.coordinator().run_sync(&cancel).await.unwrap();
    assert_eq!(summary.failed, 1);

    let record = feature.store().get(id).await.unwrap().unwrap();
    assert_eq!(record.status, SyncStatus::Failed);
    assert_eq!(record.attempts, 2);
}

#[tokio::test]
async fn simultaneous_passes_submit_each_record_once() {
    let dir = TempDir::new().unwrap();
    let submitter = Arc::new(MockSubmitter::with_delay(Duration::from_millis(20)));
    let feature = feature_with(&dir, submitter.clone(), None).await;

    let names = ["Ann", "Ben", "Cat", "Dov", "Eli"];
    for name in names {
        feature.form_manager().save_offline(&patient(name)).await.unwrap();
    }

    // A second coordinator over the same database does not share the pass
    // lock, so only the store's in-flight guard keeps them apart.
    let pool = init_db(&dir.path().join("queue.db")).await.unwrap();
    let other = RegistrationFeature::with_submitter(pool, submitter.clone(), None)
        .await
        .unwrap();
    let rival: SyncCoordinator = other.coordinator().clone();

    let cancel = CancellationToken::new();
    let (a, b, c) = tokio::join!(
        feature.coordinator().run_sync(&cancel),
        feature.coordinator().run_sync(&cancel),
        rival.run_sync(&cancel),
    );

    let mut submitted = submitter.submitted_names();
    submitted.sort();
    assert_eq!(submitted, vec!["Ann", "Ben", "Cat", "Dov", "Eli"]);

    let synced: usize = [a, b, c].into_iter().flatten().map(|s| s.synced).sum();
    assert_eq!(synced, names.len());
    assert!(feature.store().list().await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_pass_leaves_rest_queued() {
    let dir = TempDir::new().unwrap();
    let submitter = Arc::new(MockSubmitter::with_delay(Duration::from_millis(50)));
    let feature = feature_with(&dir, submitter.clone(), None).await;

    for name in ["Ann", "Ben", "Cat"] {
        feature.form_manager().save_offline(&patient(name)).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let summary = feature.coordinator().run_sync(&cancel).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.synced, 1);

    let remaining = feature.store().list().await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining
        .iter()
        .all(|r| r.status == SyncStatus::Pending && r.attempts == 0));
}

#[tokio::test]
async fn queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let submitter = Arc::new(MockSubmitter::new());

    let id = {
        let feature = feature_with(&dir, submitter.clone(), None).await;
        feature
            .form_manager()
            .save_offline(&patient("Fay"))
            .await
            .unwrap()
    };

    let feature = feature_with(&dir, submitter.clone(), None).await;
    let records = feature.store().list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].payload.display_name(), "Fay Test");
}

#[tokio::test]
async fn second_process_does_not_steal_a_running_submission() {
    let dir = TempDir::new().unwrap();
    let slow = Arc::new(MockSubmitter::with_delay(Duration::from_millis(300)));
    let running = feature_with(&dir, slow.clone(), None).await;
    let id = running
        .form_manager()
        .save_offline(&patient("Gus"))
        .await
        .unwrap();

    let pass = {
        let coordinator = running.coordinator().clone();
        tokio::spawn(async move { coordinator.run_sync(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Another command starts against the same queue mid-submission.
    let other = feature_with(&dir, slow.clone(), None).await;
    let record = other.store().get(id).await.unwrap().unwrap();
    assert_eq!(record.status, SyncStatus::InFlight);
    let theirs = other
        .coordinator()
        .run_sync(&CancellationToken::new())
        .await
        .unwrap();

    let ours = pass.await.unwrap().unwrap();
    assert_eq!(slow.calls().len(), 1);
    assert_eq!(ours.synced, 1);
    assert_eq!(ours.storage_errors, 0);
    assert_eq!(theirs.skipped, 1);
    assert_eq!(theirs.synced, 0);
    assert!(running.store().list().await.unwrap().is_empty());
}
