use crate::settings::{ScopeKey, SettingsRecord, TtlSetting};
use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::info;

/// Manage this server's message time-to-live policy
#[poise::command(
    slash_command,
    subcommands("info", "set", "unset", "reset"),
    required_permissions = "MANAGE_GUILD",
    guild_only
)]
pub async fn ttl(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show the TTL policy for this server and channel
#[poise::command(slash_command)]
pub async fn info(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let channel_id = ctx.channel_id();
    let store = &ctx.data().store;

    let server = store.get_server_settings(guild_id.get()).await?;
    let channel = store
        .get_server_channel_settings(guild_id.get(), channel_id.get())
        .await?;
    let effective = store
        .effective_channel_settings(guild_id.get(), channel_id.get())
        .await?;

    let embed = serenity::CreateEmbed::new()
        .title("⏳ Message TTL")
        .field("Server TTL", fmt_ttl_field(server.default_message_ttl), true)
        .field("Channel TTL", fmt_ttl_field(channel.default_message_ttl), true)
        .field("Effective TTL", fmt_effective_ttl(effective.message_ttl), true)
        .field("Min / Max", format!(
            "{} / {}",
            fmt_effective_ttl(effective.min_message_ttl),
            fmt_effective_ttl(effective.max_message_ttl)
        ), true)
        .field("Pins included", if effective.include_pins { "yes" } else { "no" }, true)
        .color(0x5865F2);

    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Set the message TTL (e.g. 2h, 7d, forever)
#[poise::command(slash_command)]
pub async fn set(
    ctx: Context<'_>,
    #[description = "Message TTL (e.g. 30m, 2h, 7d, or 'forever')"] ttl: Option<String>,
    #[description = "Lower bound for user-set TTLs"] min_ttl: Option<String>,
    #[description = "Upper bound for user-set TTLs"] max_ttl: Option<String>,
    #[description = "Whether pinned messages expire too"] include_pins: Option<bool>,
    #[description = "Apply to this channel only instead of the whole server"]
    this_channel_only: Option<bool>,
) -> Result<(), Error> {
    if ttl.is_none() && min_ttl.is_none() && max_ttl.is_none() && include_pins.is_none() {
        ctx.say("❌ Please specify at least one setting to change.").await?;
        return Ok(());
    }

    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let scope = server_scope(guild_id, ctx.channel_id(), this_channel_only.unwrap_or(false));
    let store = &ctx.data().store;

    let current = get_record(ctx, scope).await?;
    let mut updated = current.clone();
    if let Some(input) = ttl {
        let Some(value) = parse_ttl(ctx, &input).await? else { return Ok(()) };
        updated.default_message_ttl = Some(value);
    }
    if let Some(input) = min_ttl {
        let Some(value) = parse_ttl(ctx, &input).await? else { return Ok(()) };
        updated.min_message_ttl = Some(value);
    }
    if let Some(input) = max_ttl {
        let Some(value) = parse_ttl(ctx, &input).await? else { return Ok(()) };
        updated.max_message_ttl = Some(value);
    }
    if let Some(pins) = include_pins {
        updated.include_pins = Some(pins);
    }

    // Unchanged settings are not worth a database write.
    if updated == current {
        ctx.say("ℹ️ Those settings are already in effect.").await?;
        return Ok(());
    }

    store.set_server_settings(updated.clone()).await?;
    info!("Updated TTL settings for scope {:?}", updated.scope);
    ctx.say(format!("✅ TTL policy updated: {}", describe(&updated))).await?;
    Ok(())
}

/// Clear the TTL overrides for this channel or the whole server
#[poise::command(slash_command)]
pub async fn unset(
    ctx: Context<'_>,
    #[description = "Clear this channel's overrides only"] this_channel_only: Option<bool>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let scope = server_scope(guild_id, ctx.channel_id(), this_channel_only.unwrap_or(false));
    ctx.data().store.set_server_settings(SettingsRecord::new(scope)).await?;
    ctx.say("✅ TTL settings cleared; messages now inherit the parent policy.").await?;
    Ok(())
}

/// Remove every TTL setting for this server, including channel overrides
#[poise::command(slash_command)]
pub async fn reset(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let deleted = ctx.data().store.reset_all_server_settings(guild_id.get()).await?;
    info!("Reset {} TTL settings rows for guild {}", deleted, guild_id);
    ctx.say(format!("✅ Removed {} stored TTL setting(s) for this server.", deleted)).await?;
    Ok(())
}

/// Manage your personal message time-to-live
#[poise::command(slash_command, subcommands("my_info", "my_set", "my_unset"), guild_only)]
pub async fn myttl(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show your effective TTL in this channel
#[poise::command(slash_command, rename = "info")]
pub async fn my_info(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let effective = ctx
        .data()
        .store
        .effective_user_settings(ctx.author().id.get(), guild_id.get(), ctx.channel_id().get())
        .await?;
    ctx.say(format!(
        "⏳ Your messages in this channel expire after: **{}** (pins {})",
        fmt_effective_ttl(effective.message_ttl),
        if effective.include_pins { "included" } else { "excluded" }
    ))
    .await?;
    Ok(())
}

/// Set your personal TTL (clamped to the server's bounds)
#[poise::command(slash_command, rename = "set")]
pub async fn my_set(
    ctx: Context<'_>,
    #[description = "Message TTL (e.g. 30m, 2h, 7d, or 'forever')"] ttl: String,
    #[description = "Apply to this channel only instead of the whole server"]
    this_channel_only: Option<bool>,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let user_id = ctx.author().id;
    let scope = user_scope(
        user_id,
        guild_id,
        ctx.channel_id(),
        this_channel_only.unwrap_or(false),
    );

    let Some(value) = parse_ttl(ctx, &ttl).await? else { return Ok(()) };
    let mut record = SettingsRecord::new(scope);
    record.default_message_ttl = Some(value);
    ctx.data().store.set_user_settings(record).await?;

    // Report the TTL after server clamping, which may differ from the input.
    let effective = ctx
        .data()
        .store
        .effective_user_settings(user_id.get(), guild_id.get(), ctx.channel_id().get())
        .await?;
    ctx.say(format!(
        "✅ Personal TTL saved. Effective here: **{}**",
        fmt_effective_ttl(effective.message_ttl)
    ))
    .await?;
    Ok(())
}

/// Remove all your personal TTL settings
#[poise::command(slash_command, rename = "unset")]
pub async fn my_unset(ctx: Context<'_>) -> Result<(), Error> {
    let deleted = ctx
        .data()
        .store
        .reset_all_user_settings(ctx.author().id.get())
        .await?;
    ctx.say(format!("✅ Removed {} personal TTL setting(s).", deleted)).await?;
    Ok(())
}

fn server_scope(guild_id: serenity::GuildId, channel_id: serenity::ChannelId, channel_only: bool) -> ScopeKey {
    if channel_only {
        ScopeKey::ServerChannel { server_id: guild_id.get(), channel_id: channel_id.get() }
    } else {
        ScopeKey::Server { server_id: guild_id.get() }
    }
}

fn user_scope(
    user_id: serenity::UserId,
    guild_id: serenity::GuildId,
    channel_id: serenity::ChannelId,
    channel_only: bool,
) -> ScopeKey {
    if channel_only {
        ScopeKey::UserServerChannel {
            user_id: user_id.get(),
            server_id: guild_id.get(),
            channel_id: channel_id.get(),
        }
    } else {
        ScopeKey::UserServer { user_id: user_id.get(), server_id: guild_id.get() }
    }
}

async fn get_record(ctx: Context<'_>, scope: ScopeKey) -> Result<SettingsRecord, Error> {
    let store = &ctx.data().store;
    let record = match scope {
        ScopeKey::Server { server_id } => store.get_server_settings(server_id).await?,
        ScopeKey::ServerChannel { server_id, channel_id } => {
            store.get_server_channel_settings(server_id, channel_id).await?
        }
        _ => return Err("Unexpected settings scope".into()),
    };
    Ok(record)
}

fn describe(record: &SettingsRecord) -> String {
    let mut parts = Vec::new();
    if let Some(ttl) = record.default_message_ttl {
        parts.push(format!("ttl `{ttl}`"));
    }
    if let Some(min) = record.min_message_ttl {
        parts.push(format!("min `{min}`"));
    }
    if let Some(max) = record.max_message_ttl {
        parts.push(format!("max `{max}`"));
    }
    if let Some(pins) = record.include_pins {
        parts.push(format!("pins {}", if pins { "included" } else { "excluded" }));
    }
    if parts.is_empty() {
        "all settings inherited".to_string()
    } else {
        parts.join(", ")
    }
}

/// Parses TTL input, replying to the user and returning `None` when invalid.
async fn parse_ttl(ctx: Context<'_>, input: &str) -> Result<Option<TtlSetting>, Error> {
    match TtlSetting::parse(input) {
        Ok(ttl) => Ok(Some(ttl)),
        Err(err) => {
            ctx.say(format!("❌ {err}. Examples: `30m`, `2h`, `7d`, `forever`.")).await?;
            Ok(None)
        }
    }
}

fn fmt_ttl_field(ttl: Option<TtlSetting>) -> String {
    match ttl {
        None => "inherit".to_string(),
        Some(ttl) => format!("`{ttl}`"),
    }
}

fn fmt_effective_ttl(ttl: Option<u32>) -> String {
    match ttl {
        None => "forever".to_string(),
        Some(secs) => TtlSetting::Seconds(secs).to_string(),
    }
}
