pub mod commands;
pub mod config;
pub mod db;
pub mod message;
pub mod permissions;
pub mod settings;
pub mod store;
pub mod sweeper;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub store: std::sync::Arc<store::SettingsStore>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
