pub mod database;
pub mod history;
pub mod models;
pub mod server_db;

pub use history::SqliteHistoryStore;
pub use models::HistoryRecord;
pub use server_db::ServerDatabase;

use std::fs;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::common::ChatBroadcast;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("stored message {seq} is corrupt: {reason}")]
    Corrupt { seq: i64, reason: String },
}

/// Durable chat history.
///
/// Pages are numbered from 1 and ordered newest first.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persists one message and returns its sequence number.
    async fn save_message(&self, message: &ChatBroadcast) -> Result<i64, StorageError>;

    async fn get_messages(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<HistoryRecord>, StorageError>;

    async fn count_messages(&self) -> Result<u64, StorageError>;
}

/// Ensure the directory holding `path` exists
pub fn ensure_parent_dir<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    match path.as_ref().parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
