use clap::{Args, Subcommand};
use std::io::{self, Write};

use super::OutputFormat;
use crate::models::{RegistrationId, SyncStatus};
use crate::{RegistrationFeature, StoreError};

/// Inspect and manage registrations waiting to be synced
#[derive(Args)]
pub struct QueueCommand {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// List queued registrations, oldest first
    List {
        /// Only show records with this status (pending, in-flight, failed)
        #[arg(long, short)]
        status: Option<SyncStatus>,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show one queued registration in full
    Show {
        /// Queue record ID
        id: RegistrationId,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Return a failed registration to the queue
    Retry {
        /// Queue record ID
        id: RegistrationId,

        /// Start the attempt count over
        #[arg(long)]
        reset_attempts: bool,
    },

    /// Remove a registration from the queue without sending it
    Discard {
        /// Queue record ID
        id: RegistrationId,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },
}

impl QueueCommand {
    pub async fn run(
        &self,
        feature: &RegistrationFeature,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let store = feature.store();

        match &self.command {
            QueueSubcommand::List { status, format } => {
                let records: Vec<_> = store
                    .list()
                    .await?
                    .into_iter()
                    .filter(|r| status.map_or(true, |s| r.status == s))
                    .collect();

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&records)?);
                    }
                    OutputFormat::Text => {
                        if records.is_empty() {
                            println!("No queued registrations.");
                            return Ok(());
                        }

                        println!(
                            "{:<36}  {:<9}  {:<19}  {:>8}  PATIENT",
                            "ID", "STATUS", "CAPTURED", "ATTEMPTS"
                        );
                        println!("{}", "-".repeat(100));
                        for record in &records {
                            println!(
                                "{:<36}  {:<9}  {:<19}  {:>8}  {}",
                                record.id,
                                record.status,
                                record.created_at.format("%Y-%m-%d %H:%M:%S"),
                                record.attempts,
                                record.payload.display_name()
                            );
                        }
                        println!("\nTotal: {} registration(s)", records.len());
                    }
                }
                Ok(())
            }

            QueueSubcommand::Show { id, format } => {
                let record = store
                    .get(*id)
                    .await?
                    .ok_or_else(|| format!("No queued registration with ID '{}'", id))?;

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&record)?);
                    }
                    OutputFormat::Text => {
                        println!("Queue record: {}", record.id);
                        println!("  status:   {}", record.status);
                        println!("  captured: {}", record.created_at.to_rfc3339());
                        println!("  attempts: {}", record.attempts);
                        if let Some(err) = &record.last_error {
                            println!("  last error: {}", err);
                        }
                        println!();
                        print!("{}", record.payload);
                    }
                }
                Ok(())
            }

            QueueSubcommand::Retry { id, reset_attempts } => {
                store.requeue(*id, *reset_attempts).await?;
                println!("Requeued {}; it will be sent on the next sync.", id);
                Ok(())
            }

            QueueSubcommand::Discard { id, force } => {
                let name = match store.get(*id).await {
                    Ok(Some(record)) if record.status == SyncStatus::InFlight => {
                        return Err(
                            format!("Registration {} is being submitted right now", id).into()
                        );
                    }
                    Ok(Some(record)) => record.payload.display_name(),
                    Ok(None) => {
                        return Err(format!("No queued registration with ID '{}'", id).into());
                    }
                    // Unreadable rows can still be removed.
                    Err(StoreError::Corrupt { .. }) => "(unreadable record)".to_string(),
                    Err(e) => return Err(e.into()),
                };

                if !force {
                    print!(
                        "Discard registration of '{}'? It will never reach the server. [y/N] ",
                        name
                    );
                    io::stdout().flush()?;

                    let mut input = String::new();
                    io::stdin().read_line(&mut input)?;

                    if !input.trim().eq_ignore_ascii_case("y") {
                        println!("Discard cancelled.");
                        return Ok(());
                    }
                }

                store.discard(*id).await?;
                println!("Discarded registration of {}", name);
                Ok(())
            }
        }
    }
}
