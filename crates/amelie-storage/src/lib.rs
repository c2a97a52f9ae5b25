//! amelie-storage: SQLite-based persistence for per-conversation settings.
//!
//! Only preferences (detail level, video mode) are stored. Media, descriptions
//! and message history are never written here.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use amelie_types::{ConversationConfig, DetailLevel, VideoMode};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS conversation_settings (
        conversation_id TEXT PRIMARY KEY,
        detail_level TEXT NOT NULL DEFAULT 'short',
        video_mode TEXT NOT NULL DEFAULT 'caption_only',
        updated_at INTEGER NOT NULL
    );";

/// SQLite-based store of conversation settings.
pub struct AmelieStorage {
    conn: Arc<Mutex<Connection>>,
}

impl AmelieStorage {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            // Connection::open reports a missing directory as a generic error.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Storage opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Read the settings of a conversation, falling back to defaults.
    ///
    /// Unrecognized stored values are treated as unset.
    pub async fn get_config(&self, conversation_id: &str) -> Result<ConversationConfig> {
        let conn = self.conn.clone();
        let id = conversation_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT detail_level, video_mode FROM conversation_settings
                     WHERE conversation_id = ?1",
                    rusqlite::params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let mut config = ConversationConfig::defaults_for(id);
            if let Some((detail, video)) = row {
                match detail.parse::<DetailLevel>() {
                    Ok(level) => config.detail_level = level,
                    Err(e) => tracing::warn!(
                        conversation_id = %config.conversation_id,
                        "Ignoring stored detail level: {e}"
                    ),
                }
                match video.parse::<VideoMode>() {
                    Ok(mode) => config.video_mode = mode,
                    Err(e) => tracing::warn!(
                        conversation_id = %config.conversation_id,
                        "Ignoring stored video mode: {e}"
                    ),
                }
            }
            Ok(config)
        })
        .await?
    }

    /// Save the full settings record of a conversation.
    pub async fn set_config(&self, config: &ConversationConfig) -> Result<()> {
        let conn = self.conn.clone();
        let config = config.clone();
        let now = chrono::Utc::now().timestamp_millis();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO conversation_settings
                    (conversation_id, detail_level, video_mode, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    detail_level = excluded.detail_level,
                    video_mode = excluded.video_mode,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    config.conversation_id,
                    config.detail_level.as_str(),
                    config.video_mode.as_str(),
                    now,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Change only the detail level, keeping the video mode.
    pub async fn set_detail_level(&self, conversation_id: &str, level: DetailLevel) -> Result<()> {
        self.upsert_column(conversation_id, "detail_level", level.as_str())
            .await
    }

    /// Change only the video mode, keeping the detail level.
    pub async fn set_video_mode(&self, conversation_id: &str, mode: VideoMode) -> Result<()> {
        self.upsert_column(conversation_id, "video_mode", mode.as_str())
            .await
    }

    /// `column` must be one of the schema's setting columns.
    async fn upsert_column(
        &self,
        conversation_id: &str,
        column: &'static str,
        value: &'static str,
    ) -> Result<()> {
        let conn = self.conn.clone();
        let id = conversation_id.to_string();
        let now = chrono::Utc::now().timestamp_millis();
        let sql = format!(
            "INSERT INTO conversation_settings (conversation_id, {column}, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(conversation_id) DO UPDATE SET
                {column} = excluded.{column},
                updated_at = excluded.updated_at"
        );
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(&sql, rusqlite::params![id, value, now])?;
            Ok(())
        })
        .await?
    }

    /// Forget the settings of a conversation.
    pub async fn delete_config(&self, conversation_id: &str) -> Result<()> {
        let conn = self.conn.clone();
        let id = conversation_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "DELETE FROM conversation_settings WHERE conversation_id = ?1",
                rusqlite::params![id],
            )?;
            Ok(())
        })
        .await?
    }

    /// Number of conversations with stored settings.
    pub async fn count_configs(&self) -> Result<i64> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.query_row(
                "SELECT COUNT(*) FROM conversation_settings",
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await?
    }
}
