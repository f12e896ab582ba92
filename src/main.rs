use poise::serenity_prelude as serenity;
use std::sync::Arc;
use std::time::Duration;
use sweeper::commands::ttl;
use sweeper::{config::Config, Data};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;
    let discord_token = config.discord_token.clone();

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![ttl::ttl(), ttl::myttl()],
            event_handler: |_ctx, event, _framework, data| {
                Box::pin(async move {
                    if let serenity::FullEvent::Message { new_message } = event {
                        // Only the IDs are recorded; content is never stored.
                        if let Some(message) =
                            sweeper::message::TtlMessage::from_discord_message(new_message)
                        {
                            if let Err(err) = data.store.frontfill_message(&message).await {
                                error!("Failed to record message ids: {:#}", err);
                            }
                        }
                    }
                    Ok(())
                })
            },
            ..Default::default()
        })
        .setup(|ctx, _ready, framework| {
            Box::pin(async move {
                info!("Bot is ready!");
                if let Some(dev_guild_id) = config.dev_guild_id {
                    poise::builtins::register_in_guild(
                        ctx,
                        &framework.options().commands,
                        serenity::GuildId::new(dev_guild_id),
                    )
                    .await?;
                } else if config.register_commands {
                    poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                }

                // Set bot status
                ctx.set_activity(Some(serenity::ActivityData::custom(&config.status_message)));

                let db = sweeper::db::Database::new(&config).expect("Failed to open database");
                db.execute_init().expect("Failed to initialize database");
                let store = Arc::new(sweeper::store::SettingsStore::new(db));

                let sweep_task = sweeper::sweeper::MessageSweeper::new(
                    store.clone(),
                    Duration::from_secs(config.sweep_interval_secs),
                    config.fetch_page_size,
                    Duration::from_secs(config.permission_cooldown_secs),
                );
                tokio::spawn(sweep_task.run(ctx.clone()));

                Ok(Data { config, store })
            })
        })
        .build();

    // The message-content intent is deliberately not requested: the bot only
    // ever looks at IDs and the pinned flag.
    let intents = serenity::GatewayIntents::non_privileged();

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    Ok(())
}
