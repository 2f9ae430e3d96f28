use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::common::ChatBroadcast;

use super::server_db::ServerDatabase;
use super::{HistoryRecord, HistoryStore, StorageError};

/// [`HistoryStore`] backed by SQLite.
///
/// Queries run on tokio's blocking pool; the connection is shared behind a mutex.
#[derive(Clone)]
pub struct SqliteHistoryStore {
    db: Arc<Mutex<ServerDatabase>>,
}

impl SqliteHistoryStore {
    pub fn new(db: ServerDatabase) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Ok(Self::new(ServerDatabase::with_path(path)?))
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self::new(ServerDatabase::in_memory()?))
    }

    async fn with_db<T, F>(&self, work: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&ServerDatabase) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StorageError::Poisoned)?;
            work(&guard)
        })
        .await?
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn save_message(&self, message: &ChatBroadcast) -> Result<i64, StorageError> {
        let message = message.clone();
        self.with_db(move |db| Ok(db.insert_message(&message)?))
            .await
            .inspect_err(|err| log::error!("Failed to save message: {err}"))
    }

    async fn get_messages(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<HistoryRecord>, StorageError> {
        let offset = u64::from(page.saturating_sub(1)) * u64::from(page_size);
        self.with_db(move |db| db.get_messages(page_size, offset))
            .await
            .inspect_err(|err| log::error!("Failed to load history page {page}: {err}"))
    }

    async fn count_messages(&self) -> Result<u64, StorageError> {
        self.with_db(|db| Ok(db.message_count()?))
            .await
            .inspect_err(|err| log::error!("Failed to count messages: {err}"))
    }
}
