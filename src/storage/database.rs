use rusqlite::{Connection, Result as SqlResult};
use std::path::Path;
use std::time::Duration;

/// How long a statement waits on a locked database file before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite connection tuned for an append-heavy history table
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database file in WAL mode
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            log::warn!("SQLite refused WAL mode; using {mode} journal");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> SqlResult<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_databases_use_write_ahead_logging() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("wal.db")).unwrap();

        let mode: String = db
            .connection()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
