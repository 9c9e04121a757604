use clap::{Args, Subcommand};

use super::OutputFormat;
use crate::config::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!(
                            "database_path: {}",
                            config.database_path.value.display()
                        );
                        println!("  source: {}", config.database_path.source);
                        println!();

                        println!(
                            "remote.base_url: {}",
                            config.remote.base_url.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "remote.username: {}",
                            config.remote.username.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "remote.password: {}",
                            if config.remote.password.is_some() { "(set)" } else { "(not set)" }
                        );
                        println!("remote.timeout_secs: {}", config.remote.timeout_secs);
                        println!();

                        match config.sync.max_attempts {
                            Some(max) => println!("sync.max_attempts: {}", max),
                            None => println!("sync.max_attempts: (unlimited)"),
                        }
                        println!("sync.interval_secs: {}", config.sync.interval_secs);
                        println!("sync.claim_lease_secs: {}", config.sync.claim_lease_secs);
                    }
                }
                Ok(())
            }
        }
    }
}
