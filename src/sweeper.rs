//! The retrieval and deletion loop.
//!
//! One sweep walks every known guild text channel, fetches a page of
//! messages past the channel's watermark, classifies each against the
//! effective TTL policy and deletes the expired ones. Messages too old for
//! Discord's bulk endpoint go one at a time; the rest go in a single batch.
//! A failing channel is logged and skipped, never the whole sweep.

use crate::message::TtlMessage;
use crate::permissions::PermissionGate;
use crate::store::SettingsStore;
use chrono::{DateTime, Utc};
use serenity::all::{ChannelId, ChannelType, GetMessages, GuildChannel, MessageId};
use serenity::client::Context;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

pub struct MessageSweeper {
    store: Arc<SettingsStore>,
    interval: Duration,
    page_size: u8,
    // Per-channel cursor: the newest message id confirmed deleted. Process
    // lifetime only; a restart rescans from the channel's creation.
    watermarks: HashMap<ChannelId, MessageId>,
    gate: PermissionGate,
}

impl MessageSweeper {
    pub fn new(
        store: Arc<SettingsStore>,
        interval: Duration,
        page_size: u8,
        permission_cooldown: Duration,
    ) -> Self {
        Self {
            store,
            interval,
            page_size,
            watermarks: HashMap::new(),
            gate: PermissionGate::new(permission_cooldown),
        }
    }

    /// Runs sweeps for the lifetime of the process.
    pub async fn run(mut self, ctx: Context) {
        info!("Starting message sweeper (interval: {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            debug!("Running message sweep...");
            self.sweep(&ctx).await;
        }
    }

    async fn sweep(&mut self, ctx: &Context) {
        // DMs never appear here: only guild channels are enumerated.
        for channel in sweepable_channels(ctx) {
            if !self.gate.can_operate(ctx, &channel) {
                continue;
            }
            if let Err(err) = self.sweep_channel(ctx, &channel).await {
                error!(
                    "Sweep failed for channel {} in guild {}: {:#}",
                    channel.id, channel.guild_id, err
                );
            }
        }
    }

    async fn sweep_channel(&mut self, ctx: &Context, channel: &GuildChannel) -> anyhow::Result<()> {
        // The channel's own snowflake doubles as a "start of channel" cursor.
        let after = *self
            .watermarks
            .entry(channel.id)
            .or_insert_with(|| MessageId::new(channel.id.get()));

        let builder = GetMessages::new().after(after).limit(self.page_size);
        let fetched = channel.id.messages(&ctx.http, builder).await?;
        if fetched.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut page = Vec::new();
        let mut expired = Vec::new();
        for discord_message in &fetched {
            let Some(message) = TtlMessage::from_discord_message(discord_message) else {
                continue;
            };
            // Every message is evaluated independently; per-author policies
            // may diverge within one page.
            let effective = self
                .store
                .effective_user_settings(
                    message.author_id.get(),
                    message.server_id.get(),
                    message.channel_id.get(),
                )
                .await?;
            if message.is_time_to_die(&effective, now) {
                expired.push(message.clone());
            }
            page.push(message);
        }

        // Record observed IDs (never content) for the backfill tables.
        if let Err(err) = self.store.backfill_messages(&page).await {
            error!("Failed to backfill message ids for channel {}: {:#}", channel.id, err);
        }

        if expired.is_empty() {
            return Ok(());
        }
        let (singular, bulk) = partition_for_deletion(expired, now);

        // Messages past the bulk age boundary go one at a time; each
        // successful delete advances the watermark.
        let mut deleted = 0usize;
        for message in &singular {
            if message.delete(&ctx.http).await {
                deleted += 1;
                self.advance_watermark(channel.id, message.message_id);
            }
        }

        // Only a page with no singular candidates is batched; mixing the two
        // risks a partial-batch failure with a stuck watermark.
        if singular.is_empty() {
            deleted += self.bulk_delete(ctx, channel.id, bulk).await?;
        }

        if deleted > 0 {
            info!("Deleted {} expired message(s) in channel {}", deleted, channel.id);
        }
        Ok(())
    }

    async fn bulk_delete(
        &mut self,
        ctx: &Context,
        channel_id: ChannelId,
        messages: Vec<TtlMessage>,
    ) -> anyhow::Result<usize> {
        match messages.len() {
            0 => Ok(0),
            // The bulk endpoint rejects batches of fewer than two messages.
            1 => {
                let message = &messages[0];
                if message.delete(&ctx.http).await {
                    self.advance_watermark(channel_id, message.message_id);
                    Ok(1)
                } else {
                    Ok(0)
                }
            }
            count => {
                let ids: Vec<MessageId> = messages.iter().map(|m| m.message_id).collect();
                channel_id.delete_messages(&ctx.http, ids).await?;
                if let Some(newest) = messages.iter().map(|m| m.message_id).max() {
                    self.advance_watermark(channel_id, newest);
                }
                Ok(count)
            }
        }
    }

    /// Watermarks only ever move forward.
    fn advance_watermark(&mut self, channel_id: ChannelId, message_id: MessageId) {
        let watermark = self.watermarks.entry(channel_id).or_insert(message_id);
        if *watermark < message_id {
            *watermark = message_id;
        }
    }
}

/// Splits expired messages into those that must be deleted one at a time
/// (too old for the bulk endpoint) and those eligible for batching.
fn partition_for_deletion(
    expired: Vec<TtlMessage>,
    now: DateTime<Utc>,
) -> (Vec<TtlMessage>, Vec<TtlMessage>) {
    expired.into_iter().partition(|m| !m.is_bulk_deletable(now))
}

/// Snapshots every guild channel kind that can hold messages. Voice and
/// stage channels carry text-in-voice chats.
fn sweepable_channels(ctx: &Context) -> Vec<GuildChannel> {
    let mut channels = Vec::new();
    for guild_id in ctx.cache.guilds() {
        if let Some(guild) = ctx.cache.guild(guild_id) {
            channels.extend(
                guild
                    .channels
                    .values()
                    .filter(|channel| is_sweepable_kind(channel.kind))
                    .cloned(),
            );
        }
    }
    channels
}

fn is_sweepable_kind(kind: ChannelType) -> bool {
    matches!(
        kind,
        ChannelType::Text | ChannelType::News | ChannelType::Voice | ChannelType::Stage
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BULK_DELETION_MAX_AGE_SECS;
    use serenity::all::{GuildId, UserId};

    fn message_aged(now: DateTime<Utc>, age_secs: i64) -> TtlMessage {
        const DISCORD_EPOCH_MILLIS: i64 = 1_420_070_400_000;
        let created = now - chrono::Duration::seconds(age_secs);
        let id = ((created.timestamp_millis() - DISCORD_EPOCH_MILLIS) as u64) << 22;
        TtlMessage::new(GuildId::new(1), ChannelId::new(2), MessageId::new(id), UserId::new(3))
    }

    #[test]
    fn test_partition_fresh_messages_are_bulk_candidates() {
        let now = Utc::now();
        let (singular, bulk) = partition_for_deletion(
            vec![message_aged(now, 3601), message_aged(now, 7200)],
            now,
        );
        assert!(singular.is_empty());
        assert_eq!(bulk.len(), 2);
    }

    #[test]
    fn test_partition_fifteen_day_old_message_goes_singular() {
        let now = Utc::now();
        let fifteen_days = 15 * 24 * 60 * 60;
        let (singular, bulk) = partition_for_deletion(
            vec![message_aged(now, fifteen_days), message_aged(now, 3601)],
            now,
        );
        assert_eq!(singular.len(), 1);
        assert_eq!(bulk.len(), 1);
        assert!(!singular[0].is_bulk_deletable(now));
    }

    #[test]
    fn test_partition_boundary_is_inclusive_for_bulk() {
        // Snowflake timestamps are millisecond-granular; truncate `now` so
        // the exact-boundary fixtures land exactly on the boundary.
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let (singular, bulk) = partition_for_deletion(
            vec![
                message_aged(now, BULK_DELETION_MAX_AGE_SECS),
                message_aged(now, BULK_DELETION_MAX_AGE_SECS + 1),
            ],
            now,
        );
        assert_eq!(bulk.len(), 1);
        assert_eq!(singular.len(), 1);
    }

    #[test]
    fn test_watermark_advances_monotonically() {
        let store = SettingsStore::new(
            crate::db::Database::new(&crate::config::Config {
                discord_token: "test".to_string(),
                database_url: ":memory:".to_string(),
                status_message: "test".to_string(),
                sweep_interval_secs: 30,
                fetch_page_size: 100,
                permission_cooldown_secs: 600,
                dev_guild_id: None,
                register_commands: false,
            })
            .unwrap(),
        );
        let mut sweeper = MessageSweeper::new(
            Arc::new(store),
            Duration::from_secs(30),
            100,
            Duration::from_secs(600),
        );
        let channel = ChannelId::new(2);

        sweeper.advance_watermark(channel, MessageId::new(100));
        assert_eq!(sweeper.watermarks[&channel], MessageId::new(100));

        // An older delete (a lagging singular path) does not move it back.
        sweeper.advance_watermark(channel, MessageId::new(50));
        assert_eq!(sweeper.watermarks[&channel], MessageId::new(100));

        sweeper.advance_watermark(channel, MessageId::new(150));
        assert_eq!(sweeper.watermarks[&channel], MessageId::new(150));
    }

    #[test]
    fn test_sweepable_channel_kinds() {
        assert!(is_sweepable_kind(ChannelType::Text));
        assert!(is_sweepable_kind(ChannelType::News));
        assert!(is_sweepable_kind(ChannelType::Voice));
        assert!(is_sweepable_kind(ChannelType::Stage));
        assert!(!is_sweepable_kind(ChannelType::Category));
        assert!(!is_sweepable_kind(ChannelType::Private));
        assert!(!is_sweepable_kind(ChannelType::Forum));
    }
}
