//! Channel permission gating with a denial cooldown.
//!
//! Permission introspection is cheap but not free, and a channel the bot
//! cannot operate on tends to stay that way for a while. A denied channel is
//! skipped without re-checking until the cooldown elapses.

use serenity::all::{ChannelId, ChannelType, GuildChannel, Permissions};
use serenity::client::Context;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct PermissionGate {
    denied_since: HashMap<ChannelId, Instant>,
    cooldown: Duration,
}

impl PermissionGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            denied_since: HashMap::new(),
            cooldown,
        }
    }

    /// `true` if the bot may currently fetch and delete in the channel.
    pub fn can_operate(&mut self, ctx: &Context, channel: &GuildChannel) -> bool {
        self.check(channel.id, Instant::now(), || has_required_permissions(ctx, channel))
    }

    /// Cached-denial state machine; `probe` performs the actual permission
    /// check and is only consulted once per cooldown window while denied.
    fn check(&mut self, channel_id: ChannelId, now: Instant, probe: impl FnOnce() -> bool) -> bool {
        if let Some(&since) = self.denied_since.get(&channel_id) {
            if now.duration_since(since) < self.cooldown {
                return false;
            }
        }
        if probe() {
            self.denied_since.remove(&channel_id);
            true
        } else {
            debug!("Insufficient permissions for channel {}, cooling down", channel_id);
            self.denied_since.insert(channel_id, now);
            false
        }
    }
}

/// Checks the bot's current effective permissions in a guild channel:
/// view, read history and manage messages, plus connect for
/// text-in-voice channels.
pub fn has_required_permissions(ctx: &Context, channel: &GuildChannel) -> bool {
    let bot_id = ctx.cache.current_user().id;
    let Some(guild) = ctx.cache.guild(channel.guild_id) else {
        return false;
    };
    let Some(member) = guild.members.get(&bot_id) else {
        return false;
    };
    let current = guild.user_permissions_in(channel, member);

    let mut required =
        Permissions::VIEW_CHANNEL | Permissions::READ_MESSAGE_HISTORY | Permissions::MANAGE_MESSAGES;
    if matches!(channel.kind, ChannelType::Voice | ChannelType::Stage) {
        required |= Permissions::CONNECT;
    }
    current.contains(required)
}
