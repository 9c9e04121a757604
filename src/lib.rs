//! Offline-capable patient registration.
//!
//! Registrations are saved either straight to the patient server
//! ([`FormManager::save_online`]) or into a durable local queue
//! ([`FormManager::save_offline`]). A [`SyncCoordinator`] later drains the
//! queue oldest-first, submitting each record at most once at a time and
//! settling it as synced, still pending, or failed.

pub mod commands;
pub mod config;
pub mod db;
pub mod feature;
pub mod form_manager;
pub mod models;
pub mod resources;
pub mod sync;

pub use db::{LocalFormStore, StoreError};
pub use feature::{RegistrationFeature, SetupError};
pub use form_manager::FormManager;
pub use sync::{Accepted, RemoteSubmitter, SubmitError, SyncCoordinator, SyncSummary};
