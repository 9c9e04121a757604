//! Offline registration sync.
//!
//! Registrations saved while offline sit in the local queue until a host
//! trigger (reconnect, timer, or the `sync` command) runs a pass:
//!
//! ```text
//! LocalFormStore::list ─▶ mark_in_flight ─▶ RemoteSubmitter::submit ─▶ settle
//! ```
//!
//! Records are attempted oldest first, one at a time, so a patient's
//! creation always reaches the server before later edits of that patient.

mod coordinator;
mod http;
mod remote;

pub use coordinator::{FailureReport, SyncCoordinator, SyncSummary};
pub use http::{classify_status, HttpSetupError, HttpSubmitter, IDEMPOTENCY_HEADER};
pub use remote::{Accepted, RemoteSubmitter, SubmitError};
