//! TTL-relevant view of a Discord message.
//!
//! Only IDs and the pinned flag are kept; message content is never read or
//! stored. The creation time is derived from the snowflake ID, so no
//! timestamp needs persisting either.

use crate::settings::EffectiveSettings;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serenity::all::{ChannelId, GuildId, Http, Message, MessageId, UserId};
use tracing::error;

/// Discord's epoch (first second of 2015) in milliseconds.
const DISCORD_EPOCH_MILLIS: i64 = 1_420_070_400_000;

/// 14 days (Discord's bulk deletion age threshold), minus a 600 second
/// buffer so a message cannot age past the boundary mid-operation.
pub const BULK_DELETION_MAX_AGE_SECS: i64 = 60 * 60 * 24 * 14 - 600;

/// The timestamp embedded in a snowflake ID.
pub fn snowflake_timestamp(id: u64) -> DateTime<Utc> {
    let millis = DISCORD_EPOCH_MILLIS + (id >> 22) as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Data compatible with the `message_ids` database table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIdsData {
    pub server_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
}

/// A guild message reduced to what the TTL policy needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlMessage {
    pub server_id: GuildId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub author_id: UserId,
    pub created_at: DateTime<Utc>,
    pub pinned: bool,
}

impl TtlMessage {
    pub fn new(server_id: GuildId, channel_id: ChannelId, message_id: MessageId, author_id: UserId) -> Self {
        Self {
            server_id,
            channel_id,
            message_id,
            author_id,
            created_at: snowflake_timestamp(message_id.get()),
            pinned: false,
        }
    }

    /// Wraps a fetched Discord message. Returns `None` for DMs, which carry
    /// no TTL policy.
    pub fn from_discord_message(message: &Message) -> Option<Self> {
        let server_id = message.guild_id?;
        let mut msg = Self::new(server_id, message.channel_id, message.id, message.author.id);
        msg.pinned = message.pinned;
        Some(msg)
    }

    /// `true` if the message has outlived the effective TTL. A message whose
    /// age exactly equals the TTL survives one more cycle.
    pub fn is_time_to_die(&self, settings: &EffectiveSettings, now: DateTime<Utc>) -> bool {
        let Some(ttl_secs) = settings.message_ttl else {
            return false;
        };
        if self.pinned && !settings.include_pins {
            return false;
        }
        self.created_at < now - Duration::seconds(i64::from(ttl_secs))
    }

    /// `true` if the message is young enough for the bulk delete endpoint
    /// (see [`BULK_DELETION_MAX_AGE_SECS`]).
    pub fn is_bulk_deletable(&self, now: DateTime<Utc>) -> bool {
        self.created_at >= now - Duration::seconds(BULK_DELETION_MAX_AGE_SECS)
    }

    /// Attempts to delete this message from Discord. Failures are logged and
    /// reported as `false`; they never abort the caller.
    pub async fn delete(&self, http: &Http) -> bool {
        match http
            .delete_message(self.channel_id, self.message_id, Some("message exceeded its time-to-live"))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                error!(
                    "Could not delete {}/{}/{}: {}",
                    self.server_id, self.channel_id, self.message_id, err
                );
                false
            }
        }
    }

    /// Row data for the `message_ids` table. IDs only, no content.
    pub fn ids_data(&self) -> MessageIdsData {
        MessageIdsData {
            server_id: self.server_id.get(),
            channel_id: self.channel_id.get(),
            message_id: self.message_id.get(),
            author_id: self.author_id.get(),
        }
    }
}
