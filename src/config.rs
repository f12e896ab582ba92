use dotenvy::dotenv;
use serde::Deserialize;
use std::env;

#[derive(Clone, Deserialize)]
pub struct Config {
    pub discord_token: String,
    pub database_url: String,
    pub status_message: String,
    // Sweep loop settings
    pub sweep_interval_secs: u64,
    pub fetch_page_size: u8,
    pub permission_cooldown_secs: u64,
    // Command registration
    pub dev_guild_id: Option<u64>,
    pub register_commands: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/sweeper.db".to_string()),
            status_message: env::var("STATUS_MESSAGE")
                .unwrap_or_else(|_| "Sweeping up old messages".to_string()),
            sweep_interval_secs: env::var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            fetch_page_size: env::var("FETCH_PAGE_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse::<u8>()
                .unwrap_or(100)
                // Discord rejects pages larger than 100 messages.
                .min(100),
            permission_cooldown_secs: env::var("PERMISSION_COOLDOWN_SECS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .unwrap_or(600),
            dev_guild_id: env::var("DEV_GUILD_ID").ok().and_then(|id| id.parse().ok()),
            register_commands: env::var("REGISTER_COMMANDS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("database_url", &self.database_url)
            .field("status_message", &self.status_message)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("fetch_page_size", &self.fetch_page_size)
            .field("permission_cooldown_secs", &self.permission_cooldown_secs)
            .field("dev_guild_id", &self.dev_guild_id)
            .field("register_commands", &self.register_commands)
            .finish()
    }
}
