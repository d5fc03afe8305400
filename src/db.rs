//! Shared SQLite connection plumbing for the Device Registry and Reading
//! Store. A single `rusqlite::Connection` is opened once at startup in WAL
//! mode and guarded by a mutex, mirroring the connection-ownership shape
//! this codebase's desktop-companion persistence layer uses — but
//! constructed once and injected, rather than held behind a global.

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    com_port        TEXT NOT NULL,
    baud_rate       INTEGER NOT NULL,
    slave_id        INTEGER NOT NULL,
    start_reg       INTEGER NOT NULL,
    function_code   INTEGER NOT NULL,
    register_count  INTEGER NOT NULL,
    ambient_in_second_register INTEGER NOT NULL DEFAULT 0,
    graph           INTEGER NOT NULL DEFAULT 0,
    graph_y_min     REAL NOT NULL DEFAULT 0.0,
    graph_y_max     REAL NOT NULL DEFAULT 100.0,
    enabled         INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS readings (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id       INTEGER NOT NULL,
    device_name     TEXT NOT NULL,
    timestamp_utc   TEXT NOT NULL,
    value           REAL,
    ambient_temp    REAL,
    status          TEXT NOT NULL,
    raw_hex         TEXT,
    error_message   TEXT
);

CREATE INDEX IF NOT EXISTS idx_readings_device_time ON readings(device_id, timestamp_utc);
CREATE INDEX IF NOT EXISTS idx_readings_time ON readings(timestamp_utc);
"#;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(database_url: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(database_url)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a synchronous closure against the connection on a blocking
    /// thread pool thread, so SQLite's blocking I/O never stalls the async
    /// runtime's worker threads.
    pub async fn with_conn<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&Connection) -> T + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .expect("blocking db task panicked")
    }
}
