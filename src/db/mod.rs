use crate::config::Config;
use crate::message::MessageIdsData;
use crate::settings::{ttl_from_db, ttl_to_db, ScopeKey, SettingsRecord};
use anyhow::Context as AnyhowContext;
use rusqlite::{params, Connection, Result};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(config: &Config) -> Result<Self> {
        let conn = Connection::open(&config.database_url)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let sql = "
            CREATE TABLE IF NOT EXISTS server_settings (
                server_id TEXT NOT NULL,
                channel_id TEXT,
                default_message_ttl INTEGER,
                max_message_ttl INTEGER,
                min_message_ttl INTEGER,
                include_pins_by_default BOOLEAN
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_server_settings_scope
                ON server_settings (server_id, ifnull(channel_id, ''));

            CREATE TABLE IF NOT EXISTS user_settings (
                user_id TEXT NOT NULL,
                server_id TEXT,
                channel_id TEXT,
                default_message_ttl INTEGER,
                max_message_ttl INTEGER,
                min_message_ttl INTEGER,
                include_pins_by_default BOOLEAN
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_user_settings_scope
                ON user_settings (user_id, ifnull(server_id, ''), ifnull(channel_id, ''));

            CREATE TABLE IF NOT EXISTS message_ids (
                server_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                PRIMARY KEY (server_id, channel_id, message_id)
            );

            CREATE TABLE IF NOT EXISTS message_ids_metadata (
                server_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                last_backfilled_message_id TEXT NOT NULL,
                PRIMARY KEY (server_id, channel_id)
            );
        ";
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    /// Runs a blocking database closure on the blocking thread pool. Async
    /// callers must not hold the sqlite mutex across awaits.
    pub async fn run_blocking<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    // --- Server settings ---

    pub fn select_server_settings(
        &self,
        server_id: u64,
        channel_id: Option<u64>,
    ) -> anyhow::Result<Option<SettingsRecord>> {
        debug!("Database: selecting server settings {}/{:?}", server_id, channel_id);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT default_message_ttl, max_message_ttl, min_message_ttl, include_pins_by_default
             FROM server_settings WHERE server_id = ?1 AND channel_id IS ?2",
        )?;
        let mut rows = stmt.query(params![
            server_id.to_string(),
            channel_id.map(|id| id.to_string())
        ])?;

        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let scope = match channel_id {
            Some(channel_id) => ScopeKey::ServerChannel { server_id, channel_id },
            None => ScopeKey::Server { server_id },
        };
        Ok(Some(SettingsRecord {
            scope,
            default_message_ttl: ttl_from_db(row.get(0)?),
            max_message_ttl: ttl_from_db(row.get(1)?),
            min_message_ttl: ttl_from_db(row.get(2)?),
            include_pins: row.get(3)?,
        }))
    }

    pub fn upsert_server_settings(&self, record: &SettingsRecord) -> anyhow::Result<()> {
        let server_id = record
            .scope
            .server_id()
            .context("server settings record without a server scope")?
            .to_string();
        let channel_id = record.scope.channel_id().map(|id| id.to_string());
        debug!("Database: upserting server settings {}/{:?}", server_id, channel_id);

        let conn = self.conn.lock().unwrap();
        let exists = conn
            .prepare("SELECT 1 FROM server_settings WHERE server_id = ?1 AND channel_id IS ?2")?
            .exists(params![server_id, channel_id])?;

        if exists {
            conn.execute(
                "UPDATE server_settings
                 SET default_message_ttl = ?3, max_message_ttl = ?4, min_message_ttl = ?5,
                     include_pins_by_default = ?6
                 WHERE server_id = ?1 AND channel_id IS ?2",
                params![
                    server_id,
                    channel_id,
                    ttl_to_db(record.default_message_ttl),
                    ttl_to_db(record.max_message_ttl),
                    ttl_to_db(record.min_message_ttl),
                    record.include_pins,
                ],
            )?;
        } else {
            conn.execute(
                "INSERT INTO server_settings
                 (server_id, channel_id, default_message_ttl, max_message_ttl, min_message_ttl,
                  include_pins_by_default)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    server_id,
                    channel_id,
                    ttl_to_db(record.default_message_ttl),
                    ttl_to_db(record.max_message_ttl),
                    ttl_to_db(record.min_message_ttl),
                    record.include_pins,
                ],
            )?;
        }
        Ok(())
    }

    /// Removes the server-level row and every channel override for the
    /// server. Returns the number of deleted rows.
    pub fn delete_all_server_settings(&self, server_id: u64) -> anyhow::Result<usize> {
        debug!("Database: deleting all server settings for {}", server_id);
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM server_settings WHERE server_id = ?1",
            params![server_id.to_string()],
        )?;
        Ok(deleted)
    }

    // --- User settings ---

    pub fn select_user_settings(
        &self,
        user_id: u64,
        server_id: Option<u64>,
        channel_id: Option<u64>,
    ) -> anyhow::Result<Option<SettingsRecord>> {
        debug!(
            "Database: selecting user settings {}/{:?}/{:?}",
            user_id, server_id, channel_id
        );
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT default_message_ttl, max_message_ttl, min_message_ttl, include_pins_by_default
             FROM user_settings WHERE user_id = ?1 AND server_id IS ?2 AND channel_id IS ?3",
        )?;
        let mut rows = stmt.query(params![
            user_id.to_string(),
            server_id.map(|id| id.to_string()),
            channel_id.map(|id| id.to_string())
        ])?;

        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let scope = user_scope(user_id, server_id, channel_id)?;
        Ok(Some(SettingsRecord {
            scope,
            default_message_ttl: ttl_from_db(row.get(0)?),
            max_message_ttl: ttl_from_db(row.get(1)?),
            min_message_ttl: ttl_from_db(row.get(2)?),
            include_pins: row.get(3)?,
        }))
    }

    pub fn upsert_user_settings(&self, record: &SettingsRecord) -> anyhow::Result<()> {
        let user_id = record
            .scope
            .user_id()
            .context("user settings record without a user scope")?
            .to_string();
        let server_id = record.scope.server_id().map(|id| id.to_string());
        let channel_id = record.scope.channel_id().map(|id| id.to_string());
        debug!(
            "Database: upserting user settings {}/{:?}/{:?}",
            user_id, server_id, channel_id
        );

        let conn = self.conn.lock().unwrap();
        let exists = conn
            .prepare(
                "SELECT 1 FROM user_settings
                 WHERE user_id = ?1 AND server_id IS ?2 AND channel_id IS ?3",
            )?
            .exists(params![user_id, server_id, channel_id])?;

        if exists {
            conn.execute(
                "UPDATE user_settings
                 SET default_message_ttl = ?4, max_message_ttl = ?5, min_message_ttl = ?6,
                     include_pins_by_default = ?7
                 WHERE user_id = ?1 AND server_id IS ?2 AND channel_id IS ?3",
                params![
                    user_id,
                    server_id,
                    channel_id,
                    ttl_to_db(record.default_message_ttl),
                    ttl_to_db(record.max_message_ttl),
                    ttl_to_db(record.min_message_ttl),
                    record.include_pins,
                ],
            )?;
        } else {
            conn.execute(
                "INSERT INTO user_settings
                 (user_id, server_id, channel_id, default_message_ttl, max_message_ttl,
                  min_message_ttl, include_pins_by_default)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user_id,
                    server_id,
                    channel_id,
                    ttl_to_db(record.default_message_ttl),
                    ttl_to_db(record.max_message_ttl),
                    ttl_to_db(record.min_message_ttl),
                    record.include_pins,
                ],
            )?;
        }
        Ok(())
    }

    pub fn delete_all_user_settings(&self, user_id: u64) -> anyhow::Result<usize> {
        debug!("Database: deleting all user settings for {}", user_id);
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM user_settings WHERE user_id = ?1",
            params![user_id.to_string()],
        )?;
        Ok(deleted)
    }

    // --- Message ID backfill (IDs only, never content) ---

    pub fn insert_message_ids(&self, messages: &[MessageIdsData]) -> anyhow::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        debug!("Database: inserting {} message ids", messages.len());
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for message in messages {
            tx.execute(
                "INSERT OR IGNORE INTO message_ids (server_id, channel_id, message_id, author_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    message.server_id.to_string(),
                    message.channel_id.to_string(),
                    message.message_id.to_string(),
                    message.author_id.to_string(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_message_ids_for_channel(&self, server_id: u64, channel_id: u64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM message_ids WHERE server_id = ?1 AND channel_id = ?2",
            params![server_id.to_string(), channel_id.to_string()],
        )?;
        Ok(deleted)
    }

    pub fn select_last_backfilled_message_id(
        &self,
        server_id: u64,
        channel_id: u64,
    ) -> anyhow::Result<Option<u64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT last_backfilled_message_id FROM message_ids_metadata
             WHERE server_id = ?1 AND channel_id = ?2",
        )?;
        let mut rows = stmt.query(params![server_id.to_string(), channel_id.to_string()])?;

        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let raw: String = row.get(0)?;
        let id = raw
            .parse::<u64>()
            .with_context(|| format!("Invalid last_backfilled_message_id '{raw}'"))?;
        Ok(Some(id))
    }

    pub fn upsert_last_backfilled_message_id(
        &self,
        server_id: u64,
        channel_id: u64,
        message_id: u64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO message_ids_metadata (server_id, channel_id, last_backfilled_message_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(server_id, channel_id) DO UPDATE SET last_backfilled_message_id = ?3",
            params![
                server_id.to_string(),
                channel_id.to_string(),
                message_id.to_string(),
            ],
        )?;
        Ok(())
    }
}

fn user_scope(user_id: u64, server_id: Option<u64>, channel_id: Option<u64>) -> anyhow::Result<ScopeKey> {
    match (server_id, channel_id) {
        (None, None) => Ok(ScopeKey::User { user_id }),
        (Some(server_id), None) => Ok(ScopeKey::UserServer { user_id, server_id }),
        (Some(server_id), Some(channel_id)) => {
            Ok(ScopeKey::UserServerChannel { user_id, server_id, channel_id })
        }
        (None, Some(_)) => anyhow::bail!("user channel settings require a server id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TtlSetting;

    fn test_config() -> Config {
        Config {
            discord_token: "test".to_string(),
            database_url: ":memory:".to_string(),
            status_message: "test".to_string(),
            sweep_interval_secs: 30,
            fetch_page_size: 100,
            permission_cooldown_secs: 600,
            dev_guild_id: None,
            register_commands: false,
        }
    }

    fn test_db() -> Database {
        let db = Database::new(&test_config()).unwrap();
        db.execute_init().unwrap();
        db
    }

    #[test]
    fn test_server_settings_round_trip() {
        let db = test_db();

        // Nothing persisted yet.
        assert!(db.select_server_settings(1, None).unwrap().is_none());

        let mut record = SettingsRecord::new(ScopeKey::Server { server_id: 1 });
        record.default_message_ttl = Some(TtlSetting::Seconds(3600));
        record.min_message_ttl = Some(TtlSetting::Forever);
        record.include_pins = Some(true);
        db.upsert_server_settings(&record).unwrap();

        let loaded = db.select_server_settings(1, None).unwrap().unwrap();
        assert_eq!(loaded, record);

        // Update in place through the same upsert.
        record.default_message_ttl = Some(TtlSetting::Forever);
        db.upsert_server_settings(&record).unwrap();
        let loaded = db.select_server_settings(1, None).unwrap().unwrap();
        assert_eq!(loaded.default_message_ttl, Some(TtlSetting::Forever));
    }

    #[test]
    fn test_channel_settings_are_separate_rows() {
        let db = test_db();

        let mut server = SettingsRecord::new(ScopeKey::Server { server_id: 1 });
        server.default_message_ttl = Some(TtlSetting::Seconds(60));
        db.upsert_server_settings(&server).unwrap();

        let mut channel = SettingsRecord::new(ScopeKey::ServerChannel { server_id: 1, channel_id: 2 });
        channel.default_message_ttl = Some(TtlSetting::Seconds(120));
        db.upsert_server_settings(&channel).unwrap();

        assert_eq!(
            db.select_server_settings(1, None).unwrap().unwrap().default_message_ttl,
            Some(TtlSetting::Seconds(60))
        );
        assert_eq!(
            db.select_server_settings(1, Some(2)).unwrap().unwrap().default_message_ttl,
            Some(TtlSetting::Seconds(120))
        );
        assert!(db.select_server_settings(1, Some(3)).unwrap().is_none());
    }

    #[test]
    fn test_delete_all_server_settings() {
        let db = test_db();

        db.upsert_server_settings(&SettingsRecord {
            scope: ScopeKey::Server { server_id: 1 },
            default_message_ttl: Some(TtlSetting::Seconds(60)),
            max_message_ttl: None,
            min_message_ttl: None,
            include_pins: None,
        })
        .unwrap();
        for channel_id in 1..=5 {
            db.upsert_server_settings(&SettingsRecord {
                scope: ScopeKey::ServerChannel { server_id: 1, channel_id },
                default_message_ttl: Some(TtlSetting::Seconds(120)),
                max_message_ttl: None,
                min_message_ttl: None,
                include_pins: None,
            })
            .unwrap();
        }
        // A different server survives the reset.
        db.upsert_server_settings(&SettingsRecord {
            scope: ScopeKey::Server { server_id: 2 },
            default_message_ttl: Some(TtlSetting::Seconds(60)),
            max_message_ttl: None,
            min_message_ttl: None,
            include_pins: None,
        })
        .unwrap();

        assert_eq!(db.delete_all_server_settings(1).unwrap(), 6);
        assert!(db.select_server_settings(1, None).unwrap().is_none());
        assert!(db.select_server_settings(1, Some(3)).unwrap().is_none());
        assert!(db.select_server_settings(2, None).unwrap().is_some());
    }

    #[test]
    fn test_user_settings_round_trip() {
        let db = test_db();

        let mut record = SettingsRecord::new(ScopeKey::UserServerChannel {
            user_id: 9,
            server_id: 1,
            channel_id: 2,
        });
        record.default_message_ttl = Some(TtlSetting::Seconds(300));
        db.upsert_user_settings(&record).unwrap();

        let loaded = db.select_user_settings(9, Some(1), Some(2)).unwrap().unwrap();
        assert_eq!(loaded, record);

        // Global user scope is a distinct row.
        assert!(db.select_user_settings(9, None, None).unwrap().is_none());

        assert_eq!(db.delete_all_user_settings(9).unwrap(), 1);
        assert!(db.select_user_settings(9, Some(1), Some(2)).unwrap().is_none());
    }

    #[test]
    fn test_message_id_backfill_rows() {
        let db = test_db();

        let rows = vec![
            MessageIdsData { server_id: 1, channel_id: 2, message_id: 100, author_id: 9 },
            MessageIdsData { server_id: 1, channel_id: 2, message_id: 101, author_id: 9 },
        ];
        db.insert_message_ids(&rows).unwrap();
        // Duplicate inserts are ignored.
        db.insert_message_ids(&rows).unwrap();

        assert_eq!(db.select_last_backfilled_message_id(1, 2).unwrap(), None);
        db.upsert_last_backfilled_message_id(1, 2, 101).unwrap();
        assert_eq!(db.select_last_backfilled_message_id(1, 2).unwrap(), Some(101));
        db.upsert_last_backfilled_message_id(1, 2, 205).unwrap();
        assert_eq!(db.select_last_backfilled_message_id(1, 2).unwrap(), Some(205));

        assert_eq!(db.delete_message_ids_for_channel(1, 2).unwrap(), 2);
    }
}
