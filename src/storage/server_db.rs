use rusqlite::{Result as SqlResult, params};
use std::path::Path;

use crate::common::ChatBroadcast;

use super::StorageError;
use super::database::Database;
use super::models::{HistoryRecord, MessageRow};

/// Chat history database used by the server
pub struct ServerDatabase {
    db: Database,
}

impl ServerDatabase {
    /// Initialize server database at custom path
    pub fn with_path<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        Self::with_database(Database::open(path)?)
    }

    pub fn in_memory() -> SqlResult<Self> {
        Self::with_database(Database::in_memory()?)
    }

    fn with_database(db: Database) -> SqlResult<Self> {
        let server_db = Self { db };
        server_db.init_schema()?;
        Ok(server_db)
    }

    fn init_schema(&self) -> SqlResult<()> {
        self.db.connection().execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                sent_at INTEGER NOT NULL,
                sender_ip TEXT NOT NULL,
                sender_port INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_sent_at ON messages(sent_at);",
        )
    }

    /// Append a message; returns its sequence number
    pub fn insert_message(&self, message: &ChatBroadcast) -> SqlResult<i64> {
        let conn = self.db.connection();
        conn.execute(
            "INSERT INTO messages (id, sender, content, sent_at, sender_ip, sender_port)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id.to_string(),
                message.sender,
                message.content,
                message.sent_at.timestamp_millis(),
                message.sender_ip,
                message.sender_port,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get messages newest first, skipping `offset`
    pub fn get_messages(&self, limit: u32, offset: u64) -> Result<Vec<HistoryRecord>, StorageError> {
        let conn = self.db.connection();
        let mut stmt = conn.prepare(
            "SELECT seq, id, sender, content, sent_at, sender_ip, sender_port
             FROM messages
             ORDER BY sent_at DESC, seq DESC
             LIMIT ?1 OFFSET ?2",
        )?;

        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit, offset], |row| {
                Ok(MessageRow {
                    seq: row.get(0)?,
                    id: row.get(1)?,
                    sender: row.get(2)?,
                    content: row.get(3)?,
                    sent_at: row.get(4)?,
                    sender_ip: row.get(5)?,
                    sender_port: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter().map(HistoryRecord::try_from).collect()
    }

    /// Get message count
    pub fn message_count(&self) -> SqlResult<u64> {
        let conn = self.db.connection();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}
