//! Sync CLI commands for draining the offline queue.

use clap::{Args, Subcommand};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::sync::SyncSummary;
use crate::RegistrationFeature;

/// Send queued registrations to the server
#[derive(Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,

    /// Keep running, syncing on an interval until Ctrl-C
    #[arg(long, short)]
    watch: bool,

    /// Seconds between passes in watch mode (overrides sync.interval_secs)
    #[arg(long, requires = "watch")]
    interval: Option<u64>,
}

#[derive(Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and queue status
    Status,
}

impl SyncCommand {
    pub async fn run(
        &self,
        feature: &RegistrationFeature,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            Some(SyncSubcommand::Status) => self.status(feature, config).await,
            None if self.watch => self.watch(feature, config).await,
            None => self.sync_once(feature).await,
        }
    }

    async fn sync_once(
        &self,
        feature: &RegistrationFeature,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let cancel = cancel_on_ctrl_c();

        println!("Syncing queued registrations...");
        println!();

        let summary = feature.coordinator().run_sync(&cancel).await;
        cancel.cancel();

        match summary {
            Some(summary) => print_summary(&summary),
            None => println!("Another sync is already queued."),
        }
        Ok(())
    }

    async fn watch(
        &self,
        feature: &RegistrationFeature,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let secs = self.interval.unwrap_or(config.sync.interval_secs).max(1);
        println!("Syncing every {}s; press Ctrl-C to stop.", secs);

        let shutdown = cancel_on_ctrl_c();
        feature
            .spawn_periodic_sync(Duration::from_secs(secs), shutdown)
            .await?;

        println!();
        if let Some(summary) = feature.coordinator().last_summary() {
            println!("Last pass:");
            print_summary(&summary);
        }
        Ok(())
    }

    async fn status(
        &self,
        feature: &RegistrationFeature,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        match &config.remote.base_url {
            Some(url) => println!("Server:       {}", url),
            None => {
                println!("Server:       not configured");
                println!();
                println!("To enable sync, add to your config file:");
                println!();
                println!("  remote:");
                println!("    base_url: \"https://emr.example.org/openmrs\"");
                println!("    username: \"registrar\"");
                println!("    password: \"...\"");
                println!();
                println!("Or set environment variables:");
                println!("  PATREG_SERVER_URL");
                println!("  PATREG_USERNAME");
                println!("  PATREG_PASSWORD");
            }
        }
        match config.sync.max_attempts {
            Some(max) => println!("Max attempts: {}", max),
            None => println!("Max attempts: unlimited"),
        }
        println!();

        let counts = feature.store().counts().await?;
        println!("Queue:");
        println!("  pending:   {}", counts.pending);
        println!("  in-flight: {}", counts.in_flight);
        println!("  failed:    {}", counts.failed);

        if counts.failed > 0 {
            println!();
            println!("Failed registrations need attention: `patreg queue list --status failed`");
        }
        Ok(())
    }
}

/// A token cancelled by the first Ctrl-C. Cancelling it also releases the
/// signal listener.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "could not listen for Ctrl-C");
                    return;
                }
                tracing::info!("interrupted, stopping after the current registration");
                token.cancel();
            }
        }
    });
    cancel
}

fn print_summary(summary: &SyncSummary) {
    if summary.is_noop() && summary.parked == 0 {
        println!("Nothing to sync.");
        return;
    }

    println!("  ✓ synced:  {}", summary.synced);
    if summary.retried > 0 {
        println!("  ↻ retry:   {} (kept for the next sync)", summary.retried);
    }
    if summary.failed > 0 {
        println!("  ✗ failed:  {}", summary.failed);
    }
    if summary.parked > 0 {
        println!("  - parked:  {} (failed earlier, see `patreg queue retry`)", summary.parked);
    }
    if summary.skipped > 0 {
        println!("  - skipped: {}", summary.skipped);
    }
    if summary.storage_errors > 0 {
        println!("  ! storage errors: {}", summary.storage_errors);
    }
    if let Some(id) = &summary.blocked_by {
        println!();
        println!(
            "  Stopped at unreadable registration {}; later registrations wait behind it.",
            id
        );
        println!("  Remove it with `patreg queue discard {}` once it is dealt with.", id);
    }

    for failure in &summary.failures {
        println!();
        println!(
            "  {} ({}) was rejected: {}",
            failure.patient_name, failure.id, failure.reason
        );
    }

    if summary.cancelled {
        println!();
        println!("Sync interrupted; remaining registrations are still queued.");
    }
}
