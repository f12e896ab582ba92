//! Cached, gated access to persisted TTL settings.
//!
//! Every operation in a domain (settings, message-id backfill) serializes
//! through that domain's mutex, so a read populating the cache from the
//! database cannot race a concurrent write or reset. The cache is
//! write-through: it is only updated after the database write succeeds.

use crate::db::Database;
use crate::message::TtlMessage;
use crate::settings::{
    resolve_user_effective, EffectiveSettings, ScopeKey, SettingsRecord,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::debug;

pub struct SettingsStore {
    db: Database,
    settings: Mutex<HashMap<ScopeKey, SettingsRecord>>,
    // (server_id, channel_id) -> last backfilled message id
    backfill: Mutex<HashMap<(u64, u64), u64>>,
}

impl SettingsStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            settings: Mutex::new(HashMap::new()),
            backfill: Mutex::new(HashMap::new()),
        }
    }

    // --- Settings reads ---

    pub async fn get_server_settings(&self, server_id: u64) -> anyhow::Result<SettingsRecord> {
        self.get_record(ScopeKey::Server { server_id }).await
    }

    pub async fn get_server_channel_settings(
        &self,
        server_id: u64,
        channel_id: u64,
    ) -> anyhow::Result<SettingsRecord> {
        self.get_record(ScopeKey::ServerChannel { server_id, channel_id }).await
    }

    pub async fn get_user_settings(&self, user_id: u64) -> anyhow::Result<SettingsRecord> {
        self.get_record(ScopeKey::User { user_id }).await
    }

    pub async fn get_user_server_settings(
        &self,
        user_id: u64,
        server_id: u64,
    ) -> anyhow::Result<SettingsRecord> {
        self.get_record(ScopeKey::UserServer { user_id, server_id }).await
    }

    pub async fn get_user_server_channel_settings(
        &self,
        user_id: u64,
        server_id: u64,
        channel_id: u64,
    ) -> anyhow::Result<SettingsRecord> {
        self.get_record(ScopeKey::UserServerChannel { user_id, server_id, channel_id }).await
    }

    /// Cache hit returns immediately; a miss reads the database under the
    /// gate. An absent row yields a virtual all-inheriting default that is
    /// cached but never persisted.
    async fn get_record(&self, scope: ScopeKey) -> anyhow::Result<SettingsRecord> {
        let mut cache = self.settings.lock().await;
        if let Some(cached) = cache.get(&scope) {
            return Ok(cached.clone());
        }
        let record = self
            .db
            .run_blocking(move |db| select_for_scope(db, scope))
            .await?
            .unwrap_or_else(|| SettingsRecord::new(scope));
        cache.insert(scope, record.clone());
        Ok(record)
    }

    // --- Settings writes ---

    pub async fn set_server_settings(&self, record: SettingsRecord) -> anyhow::Result<()> {
        match record.scope {
            ScopeKey::Server { .. } | ScopeKey::ServerChannel { .. } => {}
            _ => anyhow::bail!("not a server-scoped settings record"),
        }
        let mut cache = self.settings.lock().await;
        let persisted = record.clone();
        self.db
            .run_blocking(move |db| db.upsert_server_settings(&persisted))
            .await?;
        cache.insert(record.scope, record);
        Ok(())
    }

    pub async fn set_user_settings(&self, record: SettingsRecord) -> anyhow::Result<()> {
        if record.scope.user_id().is_none() {
            anyhow::bail!("not a user-scoped settings record");
        }
        let mut cache = self.settings.lock().await;
        let persisted = record.clone();
        self.db
            .run_blocking(move |db| db.upsert_user_settings(&persisted))
            .await?;
        cache.insert(record.scope, record);
        Ok(())
    }

    /// Deletes every persisted settings row for the server (server-level and
    /// all channel overrides) and evicts the matching cache entries.
    /// Subsequent reads observe virtual defaults.
    pub async fn reset_all_server_settings(&self, server_id: u64) -> anyhow::Result<usize> {
        let mut cache = self.settings.lock().await;
        let deleted = self
            .db
            .run_blocking(move |db| db.delete_all_server_settings(server_id))
            .await?;
        cache.retain(|scope, _| {
            scope.user_id().is_some() || scope.server_id() != Some(server_id)
        });
        debug!("Reset {} settings rows for server {}", deleted, server_id);
        Ok(deleted)
    }

    pub async fn reset_all_user_settings(&self, user_id: u64) -> anyhow::Result<usize> {
        let mut cache = self.settings.lock().await;
        let deleted = self
            .db
            .run_blocking(move |db| db.delete_all_user_settings(user_id))
            .await?;
        cache.retain(|scope, _| scope.user_id() != Some(user_id));
        debug!("Reset {} settings rows for user {}", deleted, user_id);
        Ok(deleted)
    }

    // --- Resolution ---

    /// The effective policy for a channel: channel overrides merged over the
    /// server record, inherited remainders resolved to system defaults.
    pub async fn effective_channel_settings(
        &self,
        server_id: u64,
        channel_id: u64,
    ) -> anyhow::Result<EffectiveSettings> {
        let channel = self.get_server_channel_settings(server_id, channel_id).await?;
        let server = self.get_server_settings(server_id).await?;
        Ok(channel.apply_parent(&server).into_effective())
    }

    /// The effective policy for one user in a channel: the user's settings
    /// chain resolved against the channel policy, TTL clamped by the
    /// server's min/max bounds.
    pub async fn effective_user_settings(
        &self,
        user_id: u64,
        server_id: u64,
        channel_id: u64,
    ) -> anyhow::Result<EffectiveSettings> {
        let user_channel = self
            .get_user_server_channel_settings(user_id, server_id, channel_id)
            .await?;
        let user_server = self.get_user_server_settings(user_id, server_id).await?;
        let user = self.get_user_settings(user_id).await?;
        let user_chain = user_channel.apply_parent(&user_server).apply_parent(&user);

        let server_effective = self.effective_channel_settings(server_id, channel_id).await?;
        Ok(resolve_user_effective(&user_chain, &server_effective))
    }

    // --- Message-ID backfill (separate domain, separate gate) ---

    /// Records the IDs of one newly observed message.
    pub async fn frontfill_message(&self, message: &TtlMessage) -> anyhow::Result<()> {
        let _gate = self.backfill.lock().await;
        let row = message.ids_data();
        self.db.run_blocking(move |db| db.insert_message_ids(&[row])).await
    }

    /// Bulk-records message IDs and advances each touched channel's
    /// `last_backfilled_message_id` watermark when it moved forward.
    pub async fn backfill_messages(&self, messages: &[TtlMessage]) -> anyhow::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut meta = self.backfill.lock().await;

        let rows: Vec<_> = messages.iter().map(|m| m.ids_data()).collect();
        let mut advanced: HashSet<(u64, u64)> = HashSet::new();
        for row in &rows {
            let key = (row.server_id, row.channel_id);
            let known = match meta.get(&key).copied() {
                Some(id) => Some(id),
                None => {
                    let (server_id, channel_id) = key;
                    self.db
                        .run_blocking(move |db| {
                            db.select_last_backfilled_message_id(server_id, channel_id)
                        })
                        .await?
                }
            };
            if let Some(id) = known {
                meta.entry(key).or_insert(id);
            }
            if known.map_or(true, |id| id < row.message_id) {
                meta.insert(key, row.message_id);
                advanced.insert(key);
            }
        }

        self.db.run_blocking(move |db| db.insert_message_ids(&rows)).await?;

        for (server_id, channel_id) in advanced {
            let message_id = meta[&(server_id, channel_id)];
            self.db
                .run_blocking(move |db| {
                    db.upsert_last_backfilled_message_id(server_id, channel_id, message_id)
                })
                .await?;
        }
        Ok(())
    }
}

fn select_for_scope(db: &Database, scope: ScopeKey) -> anyhow::Result<Option<SettingsRecord>> {
    match scope {
        ScopeKey::Server { server_id } => db.select_server_settings(server_id, None),
        ScopeKey::ServerChannel { server_id, channel_id } => {
            db.select_server_settings(server_id, Some(channel_id))
        }
        ScopeKey::User { user_id } => db.select_user_settings(user_id, None, None),
        ScopeKey::UserServer { user_id, server_id } => {
            db.select_user_settings(user_id, Some(server_id), None)
        }
        ScopeKey::UserServerChannel { user_id, server_id, channel_id } => {
            db.select_user_settings(user_id, Some(server_id), Some(channel_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::settings::TtlSetting;
    use serenity::all::{ChannelId, GuildId, MessageId, UserId};

    fn test_store() -> SettingsStore {
        let config = Config {
            discord_token: "test".to_string(),
            database_url: ":memory:".to_string(),
            status_message: "test".to_string(),
            sweep_interval_secs: 30,
            fetch_page_size: 100,
            permission_cooldown_secs: 600,
            dev_guild_id: None,
            register_commands: false,
        };
        let db = Database::new(&config).unwrap();
        db.execute_init().unwrap();
        SettingsStore::new(db)
    }

    fn server_record(server_id: u64, ttl: TtlSetting) -> SettingsRecord {
        let mut record = SettingsRecord::new(ScopeKey::Server { server_id });
        record.default_message_ttl = Some(ttl);
        record
    }

    fn channel_record(server_id: u64, channel_id: u64, ttl: TtlSetting) -> SettingsRecord {
        let mut record = SettingsRecord::new(ScopeKey::ServerChannel { server_id, channel_id });
        record.default_message_ttl = Some(ttl);
        record
    }

    #[tokio::test]
    async fn test_defaults_are_virtual() {
        let store = test_store();

        let record = store.get_server_settings(1).await.unwrap();
        assert!(record.is_default());

        // The default was cached but never written to the database.
        let persisted = store
            .db
            .run_blocking(|db| db.select_server_settings(1, None))
            .await
            .unwrap();
        assert!(persisted.is_none());
    }

    #[tokio::test]
    async fn test_write_through_cache() {
        let store = test_store();

        store.set_server_settings(server_record(1, TtlSetting::Seconds(3600))).await.unwrap();
        let record = store.get_server_settings(1).await.unwrap();
        assert_eq!(record.default_message_ttl, Some(TtlSetting::Seconds(3600)));

        // The row is persisted, not just cached.
        let persisted = store
            .db
            .run_blocking(|db| db.select_server_settings(1, None))
            .await
            .unwrap();
        assert!(persisted.is_some());
    }

    #[tokio::test]
    async fn test_set_rejects_wrong_scope() {
        let store = test_store();
        let user_record = SettingsRecord::new(ScopeKey::User { user_id: 9 });
        assert!(store.set_server_settings(user_record.clone()).await.is_err());
        let server = SettingsRecord::new(ScopeKey::Server { server_id: 1 });
        assert!(store.set_user_settings(server).await.is_err());
        assert!(store.set_user_settings(user_record).await.is_ok());
    }

    #[tokio::test]
    async fn test_channel_forever_overrides_server_ttl() {
        let store = test_store();
        store.set_server_settings(server_record(1, TtlSetting::Seconds(3600))).await.unwrap();
        store
            .set_server_settings(channel_record(1, 2, TtlSetting::Forever))
            .await
            .unwrap();

        let effective = store.effective_channel_settings(1, 2).await.unwrap();
        assert_eq!(effective.message_ttl, None);

        // A channel without an override inherits the server TTL.
        let other = store.effective_channel_settings(1, 3).await.unwrap();
        assert_eq!(other.message_ttl, Some(3600));
    }

    #[tokio::test]
    async fn test_reset_all_server_settings() {
        let store = test_store();
        store.set_server_settings(server_record(1, TtlSetting::Seconds(60))).await.unwrap();
        for channel_id in 1..=5 {
            store
                .set_server_settings(channel_record(1, channel_id, TtlSetting::Seconds(120)))
                .await
                .unwrap();
        }

        let deleted = store.reset_all_server_settings(1).await.unwrap();
        assert_eq!(deleted, 6);

        // Reads after the reset observe virtual, unpersisted defaults.
        assert!(store.get_server_settings(1).await.unwrap().is_default());
        assert!(store.get_server_channel_settings(1, 3).await.unwrap().is_default());
        let persisted = store
            .db
            .run_blocking(|db| db.select_server_settings(1, None))
            .await
            .unwrap();
        assert!(persisted.is_none());
    }

    #[tokio::test]
    async fn test_user_settings_resolution_with_clamp() {
        let store = test_store();

        let mut server = server_record(1, TtlSetting::Seconds(3600));
        server.min_message_ttl = Some(TtlSetting::Seconds(300));
        server.max_message_ttl = Some(TtlSetting::Seconds(7200));
        store.set_server_settings(server).await.unwrap();

        // No user settings: the server policy applies as-is.
        let effective = store.effective_user_settings(9, 1, 2).await.unwrap();
        assert_eq!(effective.message_ttl, Some(3600));

        // A user TTL below the min is raised to it.
        let mut user = SettingsRecord::new(ScopeKey::UserServer { user_id: 9, server_id: 1 });
        user.default_message_ttl = Some(TtlSetting::Seconds(30));
        store.set_user_settings(user).await.unwrap();
        let effective = store.effective_user_settings(9, 1, 2).await.unwrap();
        assert_eq!(effective.message_ttl, Some(300));

        // The most specific user scope wins over the user/server one.
        let mut narrow = SettingsRecord::new(ScopeKey::UserServerChannel {
            user_id: 9,
            server_id: 1,
            channel_id: 2,
        });
        narrow.default_message_ttl = Some(TtlSetting::Seconds(5000));
        store.set_user_settings(narrow).await.unwrap();
        let effective = store.effective_user_settings(9, 1, 2).await.unwrap();
        assert_eq!(effective.message_ttl, Some(5000));
    }

    #[tokio::test]
    async fn test_backfill_advances_metadata() {
        let store = test_store();
        let msg = |id: u64| {
            TtlMessage::new(GuildId::new(1), ChannelId::new(2), MessageId::new(id), UserId::new(9))
        };

        store.backfill_messages(&[msg(100), msg(101)]).await.unwrap();
        let last = store
            .db
            .run_blocking(|db| db.select_last_backfilled_message_id(1, 2))
            .await
            .unwrap();
        assert_eq!(last, Some(101));

        // An older page does not move the watermark backwards.
        store.backfill_messages(&[msg(50)]).await.unwrap();
        let last = store
            .db
            .run_blocking(|db| db.select_last_backfilled_message_id(1, 2))
            .await
            .unwrap();
        assert_eq!(last, Some(101));

        store.frontfill_message(&msg(200)).await.unwrap();
    }
}
