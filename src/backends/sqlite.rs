//! SQLite engine adapter.
//!
//! Every transaction gets its own connection, opened at begin and closed
//! once the transaction is finalized, so concurrent transactions never share
//! connection state. Locking between them is SQLite's own: `busy_timeout`
//! bounds how long a writer waits for another.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{ffi, Connection, Params};
use thiserror::Error;
use tracing::debug;

use crate::context::ContextKey;
use crate::transaction::Backend;

/// How `BEGIN` acquires locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BeginMode {
    /// Locks are taken on first read / first write.
    #[default]
    Deferred,
    /// The write lock is taken at begin.
    Immediate,
    /// No other connection may read or write until finalization.
    Exclusive,
}

impl BeginMode {
    fn statement(self) -> &'static str {
        match self {
            BeginMode::Deferred => "BEGIN DEFERRED",
            BeginMode::Immediate => "BEGIN IMMEDIATE",
            BeginMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// SQLite backend configuration.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the database file.
    pub path: PathBuf,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
    pub begin_mode: BeginMode,
    /// Enforce foreign key constraints on every connection.
    pub foreign_keys: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("txscope.db"),
            busy_timeout: Duration::from_secs(5),
            begin_mode: BeginMode::Deferred,
            foreign_keys: true,
        }
    }
}

impl SqliteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn begin_mode(mut self, mode: BeginMode) -> Self {
        self.begin_mode = mode;
        self
    }

    pub fn foreign_keys(mut self, value: bool) -> Self {
        self.foreign_keys = value;
        self
    }
}

#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl SqliteError {
    fn code(&self) -> Option<&ffi::Error> {
        match self {
            SqliteError::Open { source, .. } | SqliteError::Sqlite(source) => match source {
                rusqlite::Error::SqliteFailure(err, _) => Some(err),
                _ => None,
            },
        }
    }

    /// A UNIQUE or PRIMARY KEY constraint rejected the statement.
    pub fn is_unique_violation(&self) -> bool {
        self.code().is_some_and(|err| {
            err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        })
    }

    /// The database was locked by another connection for longer than
    /// `busy_timeout`.
    pub fn is_busy(&self) -> bool {
        self.code()
            .is_some_and(|err| err.code == rusqlite::ErrorCode::DatabaseBusy)
    }
}

/// An open SQLite transaction.
pub struct SqliteTx {
    conn: Connection,
}

impl SqliteTx {
    /// The connection the transaction runs on.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Execute one statement inside the transaction.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize, SqliteError> {
        Ok(self.conn.execute(sql, params)?)
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }
}

impl fmt::Debug for SqliteTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteTx")
            .field("path", &self.conn.path())
            .finish()
    }
}

pub struct SqliteBackend {
    config: SqliteConfig,
    key: ContextKey,
}

impl SqliteBackend {
    pub fn new(config: SqliteConfig) -> Self {
        Self {
            config,
            key: ContextKey::new("sqlite.tx"),
        }
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// A configured connection outside any transaction, for schema setup
    /// and reads after the fact.
    pub fn open_connection(&self) -> Result<Connection, SqliteError> {
        let conn = Connection::open(&self.config.path).map_err(|source| SqliteError::Open {
            path: self.config.path.clone(),
            source,
        })?;
        conn.busy_timeout(self.config.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", self.config.foreign_keys)?;
        Ok(conn)
    }
}

impl fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.config.path)
            .field("begin_mode", &self.config.begin_mode)
            .field("key", &self.key)
            .finish()
    }
}

impl Backend for SqliteBackend {
    type Tx = SqliteTx;
    type Error = SqliteError;

    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn key(&self) -> &ContextKey {
        &self.key
    }

    fn begin(&self) -> Result<SqliteTx, SqliteError> {
        let conn = self.open_connection()?;
        conn.execute_batch(self.config.begin_mode.statement())?;
        debug!(path = %self.config.path.display(), mode = ?self.config.begin_mode, "sqlite transaction begun");
        Ok(SqliteTx { conn })
    }

    fn commit(&self, tx: SqliteTx) -> Result<(), SqliteError> {
        // A failed COMMIT leaves the transaction open; closing the
        // connection on drop rolls it back.
        tx.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self, tx: SqliteTx) -> Result<(), SqliteError> {
        // Some errors (SQLITE_FULL, SQLITE_IOERR, ...) already rolled back.
        if tx.conn.is_autocommit() {
            return Ok(());
        }
        tx.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
