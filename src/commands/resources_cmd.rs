use clap::{Args, Subcommand};

use super::OutputFormat;
use crate::models::ResourceKind;
use crate::RegistrationFeature;

/// Prefetch or inspect the reference data the form needs offline
#[derive(Args)]
pub struct ResourcesCommand {
    #[command(subcommand)]
    pub command: ResourcesSubcommand,
}

#[derive(Subcommand)]
pub enum ResourcesSubcommand {
    /// Fetch every resource from the server into the local cache
    Refresh,

    /// Show the cached copy of one resource
    Show {
        /// current-session, address-template, relationship-types or patient-identifier-types
        kind: ResourceKind,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ResourcesCommand {
    pub async fn run(
        &self,
        feature: &RegistrationFeature,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let resources = feature.resources();

        match &self.command {
            ResourcesSubcommand::Refresh => {
                println!("Refreshing offline resources...");
                println!();

                let report = resources.refresh_all().await;
                for kind in &report.refreshed {
                    println!("  ✓ {}", kind);
                }
                for (kind, reason) in &report.failed {
                    println!("  ✗ {}: {}", kind, reason);
                }

                println!();
                if report.failed.is_empty() {
                    println!("All resources cached.");
                    Ok(())
                } else {
                    Err(format!("{} resource(s) could not be refreshed", report.failed.len()).into())
                }
            }

            ResourcesSubcommand::Show { kind, format } => {
                let resource = resources.cached(*kind).await?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&resource.body)?);
                    }
                    OutputFormat::Text => {
                        println!("{} (fetched {})", resource.kind, resource.fetched_at.to_rfc3339());
                        println!();
                        println!("{}", serde_json::to_string_pretty(&resource.body)?);
                    }
                }
                Ok(())
            }
        }
    }
}
