use clap::ValueEnum;

mod config_cmd;
mod queue;
mod register;
mod resources_cmd;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use queue::QueueCommand;
pub use register::RegisterCommand;
pub use resources_cmd::ResourcesCommand;
pub use sync_cmd::SyncCommand;

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
