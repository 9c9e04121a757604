use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use patreg::commands::{
    ConfigCommand, QueueCommand, RegisterCommand, ResourcesCommand, SyncCommand,
};
use patreg::config::Config;
use patreg::RegistrationFeature;

#[derive(Parser)]
#[command(name = "patreg")]
#[command(version)]
#[command(about = "Patient registration that keeps working offline", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a patient, online or into the offline queue
    Register(RegisterCommand),

    /// Manage the offline registration queue
    Queue(QueueCommand),

    /// Send queued registrations to the server
    Sync(SyncCommand),

    /// Manage cached reference data for offline use
    Resources(ResourcesCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "patreg=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Register(cmd)) => {
            let feature = RegistrationFeature::setup(&config).await?;
            cmd.run(&feature).await?;
        }
        Some(Commands::Queue(cmd)) => {
            let feature = RegistrationFeature::setup(&config).await?;
            cmd.run(&feature).await?;
        }
        Some(Commands::Sync(cmd)) => {
            let feature = RegistrationFeature::setup(&config).await?;
            cmd.run(&feature, &config).await?;
        }
        Some(Commands::Resources(cmd)) => {
            let feature = RegistrationFeature::setup(&config).await?;
            cmd.run(&feature).await?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
