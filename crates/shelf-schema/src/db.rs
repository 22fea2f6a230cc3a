//! Connection handling.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, SchemaError};

/// Default time to wait on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// How long a statement waits on another connection's lock.
    pub busy_timeout: Duration,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

/// An open database session.
///
/// Every component takes the underlying [`Connection`] by reference; the
/// session is closed when this value is dropped, on success or error.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create the database described by `config`.
    pub fn open(config: &DbConfig) -> Result<Self> {
        let conn = Connection::open(&config.path).map_err(SchemaError::database("open database"))?;
        conn.busy_timeout(config.busy_timeout)
            .map_err(SchemaError::database("configure busy timeout"))?;
        let db = Self::from_connection(conn)?;
        info!(path = %config.path.display(), "connected to database");
        Ok(db)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(SchemaError::database("open database"))?;
        Self::from_connection(conn)
    }

    /// Wrap an existing connection, enabling foreign-key enforcement.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(SchemaError::database("enable foreign keys"))?;
        Ok(Self { conn })
    }

    /// Path of the main database file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.conn.path().filter(|p| !p.is_empty()).map(Path::new)
    }
}

impl Deref for Database {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}
