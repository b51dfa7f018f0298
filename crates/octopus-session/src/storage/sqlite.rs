//! SQLite transcript storage (feature-gated).

use std::{path::Path, str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octopus_core::{Message, Session, SessionStatus, StorageError, TranscriptStore};
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow},
};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    working_dir TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resume_token TEXT
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    type TEXT NOT NULL,
    payload TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq);
";

fn internal(e: impl std::fmt::Display) -> StorageError {
    StorageError::Internal(e.to_string())
}

/// SQLite storage implementation.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database file.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or the database
    /// cannot be opened.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Internal(format!(
                        "creating database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(internal)?;

        Self::with_pool(pool).await
    }

    /// Create an in-memory database.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(internal)?
            .foreign_keys(true);

        // A second connection would see a different, empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(internal)?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(internal)?;
        Ok(Self { pool })
    }
}

fn session_from_row(row: &SqliteRow) -> Result<Session, StorageError> {
    let created_at: String = row.try_get("created_at").map_err(internal)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(internal)?
        .with_timezone(&Utc);
    let working_dir: String = row.try_get("working_dir").map_err(internal)?;
    Ok(Session {
        id: row.try_get("id").map_err(internal)?,
        name: row.try_get("name").map_err(internal)?,
        working_dir: working_dir.into(),
        status: SessionStatus::Idle,
        resume_token: row.try_get("resume_token").map_err(internal)?,
        created_at,
    })
}

#[async_trait]
impl TranscriptStore for SqliteStore {
    async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR IGNORE INTO sessions (id, name, working_dir, created_at, resume_token) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(session.working_dir.to_string_lossy().into_owned())
        .bind(session.created_at.to_rfc3339())
        .bind(session.resume_token.as_deref())
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn load_sessions(&self) -> Result<Vec<Session>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, name, working_dir, created_at, resume_token FROM sessions \
             ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(session_from_row).collect()
    }

    async fn set_resume_token(&self, id: &str, token: &str) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE sessions SET resume_token = ? WHERE id = ?")
            .bind(token)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn rename_session(&self, id: &str, name: &str) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE sessions SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn append_message(
        &self,
        id: &str,
        seq: u64,
        message: &Message,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(message).map_err(internal)?;
        let seq = i64::try_from(seq).map_err(internal)?;
        sqlx::query(
            "INSERT INTO messages (session_id, seq, role, type, payload) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(seq)
        .bind(message.role.as_str())
        .bind(message.body.kind())
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn load_messages(&self, id: &str) -> Result<Vec<Message>, StorageError> {
        let rows = sqlx::query("SELECT payload FROM messages WHERE session_id = ? ORDER BY seq")
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        rows.iter()
            .map(|row| {
                let payload: String = row.try_get("payload").map_err(internal)?;
                serde_json::from_str(&payload).map_err(internal)
            })
            .collect()
    }

    async fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }
}
