//! Author / book / link repositories used by the scenario tests.
//!
//! Each repository only knows how to reach "the current transaction or a
//! one-off one" through `TxManager::join_or_begin`; whether several calls
//! share one transaction is decided by the caller's context.

#![allow(dead_code)]

use rusqlite::OptionalExtension;
use serde_json::json;
use tempfile::TempDir;
use thiserror::Error;

use txscope::backends::{GitBackend, SqliteBackend, SqliteConfig, SqliteError};
use txscope::context::Context;
use txscope::storage::{GitStore, Row, RowKey, StorageError, TableName};
use txscope::transaction::{TransactionError, TxManager};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("duplicate name: {0}")]
    Duplicate(String),
    #[error(transparent)]
    Sqlite(#[from] SqliteError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Tx(#[from] TransactionError),
}

impl RepoError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RepoError::Tx(e) if e.is_cancellation())
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, RepoError::Tx(e) if e.is_panic())
    }
}

// ==================== SQLite ====================

pub type SqliteManager = TxManager<SqliteBackend>;

#[derive(Debug, Clone, PartialEq)]
pub struct Author {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Book {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthorBook {
    pub id: i64,
    pub author_id: i64,
    pub book_id: i64,
}

const SCHEMA: &str = "
    CREATE TABLE authors (
        id   INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    );
    CREATE TABLE books (
        id   INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL
    );
    CREATE TABLE author_books (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        author_id INTEGER NOT NULL REFERENCES authors(id),
        book_id   INTEGER NOT NULL REFERENCES books(id)
    );
";

pub fn sqlite_setup() -> (TempDir, SqliteManager) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let backend = SqliteBackend::new(SqliteConfig::new(dir.path().join("library.db")));
    backend.open_connection().unwrap().execute_batch(SCHEMA).unwrap();
    (dir, TxManager::new(backend))
}

pub struct AuthorRepository {
    manager: SqliteManager,
}

impl AuthorRepository {
    pub fn new(manager: &SqliteManager) -> Self {
        Self {
            manager: manager.clone(),
        }
    }

    pub fn add(&self, ctx: &Context, name: &str) -> Result<Author, RepoError> {
        self.manager.join_or_begin(Some(ctx), |tx| {
            tx.execute("INSERT INTO authors (name) VALUES (?1)", [name])
                .map_err(|e| {
                    if e.is_unique_violation() {
                        RepoError::Duplicate(name.to_string())
                    } else {
                        e.into()
                    }
                })?;
            Ok(Author {
                id: tx.last_insert_rowid(),
                name: name.to_string(),
            })
        })
    }

    pub fn find_by_name(&self, name: &str) -> Option<Author> {
        let conn = self.manager.backend().open_connection().unwrap();
        conn.query_row("SELECT id, name FROM authors WHERE name = ?1", [name], |row| {
            Ok(Author {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .optional()
        .unwrap()
    }
}

pub struct BookRepository {
    manager: SqliteManager,
}

impl BookRepository {
    pub fn new(manager: &SqliteManager) -> Self {
        Self {
            manager: manager.clone(),
        }
    }

    pub fn add(&self, ctx: &Context, name: &str) -> Result<Book, RepoError> {
        self.manager.join_or_begin(Some(ctx), |tx| {
            tx.execute("INSERT INTO books (name) VALUES (?1)", [name])?;
            Ok(Book {
                id: tx.last_insert_rowid(),
                name: name.to_string(),
            })
        })
    }

    pub fn find_by_name(&self, name: &str) -> Option<Book> {
        let conn = self.manager.backend().open_connection().unwrap();
        conn.query_row("SELECT id, name FROM books WHERE name = ?1", [name], |row| {
            Ok(Book {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .optional()
        .unwrap()
    }
}

pub struct AuthorBookRepository {
    manager: SqliteManager,
}

impl AuthorBookRepository {
    pub fn new(manager: &SqliteManager) -> Self {
        Self {
            manager: manager.clone(),
        }
    }

    pub fn link(&self, ctx: &Context, author: &Author, book: &Book) -> Result<AuthorBook, RepoError> {
        self.manager.join_or_begin(Some(ctx), |tx| {
            tx.execute(
                "INSERT INTO author_books (author_id, book_id) VALUES (?1, ?2)",
                [author.id, book.id],
            )?;
            Ok(AuthorBook {
                id: tx.last_insert_rowid(),
                author_id: author.id,
                book_id: book.id,
            })
        })
    }

    pub fn find_by_author(&self, author_id: i64) -> Vec<AuthorBook> {
        let conn = self.manager.backend().open_connection().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, author_id, book_id FROM author_books WHERE author_id = ?1")
            .unwrap();
        let rows = stmt
            .query_map([author_id], |row| {
                Ok(AuthorBook {
                    id: row.get(0)?,
                    author_id: row.get(1)?,
                    book_id: row.get(2)?,
                })
            })
            .unwrap();
        rows.collect::<Result<_, _>>().unwrap()
    }
}

pub fn count_rows(manager: &SqliteManager, table: &str) -> i64 {
    let conn = manager.backend().open_connection().unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap()
}

// ==================== Git document store ====================

pub type GitManager = TxManager<GitBackend>;

pub fn git_setup() -> (TempDir, GitManager) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = GitStore::init(dir.path()).unwrap();
    (dir, TxManager::new(GitBackend::new(store)))
}

pub fn table(name: &str) -> TableName {
    TableName::new(name).unwrap()
}

/// Author, book and link documents; names are unique per collection.
pub struct Documents {
    manager: GitManager,
}

impl Documents {
    pub fn new(manager: &GitManager) -> Self {
        Self {
            manager: manager.clone(),
        }
    }

    fn add_named(&self, ctx: &Context, collection: &str, name: &str) -> Result<RowKey, RepoError> {
        let collection = table(collection);
        self.manager.join_or_begin(Some(ctx), |tx| {
            if tx
                .scan(&collection)?
                .iter()
                .any(|row| row.get_str("name") == Some(name))
            {
                return Err(RepoError::Duplicate(name.to_string()));
            }
            let row = Row::from_value(RowKey::generate(), json!({ "name": name }))?;
            tx.insert(&collection, &row)?;
            Ok(row.key)
        })
    }

    pub fn add_author(&self, ctx: &Context, name: &str) -> Result<RowKey, RepoError> {
        self.add_named(ctx, "authors", name)
    }

    pub fn add_book(&self, ctx: &Context, name: &str) -> Result<RowKey, RepoError> {
        self.add_named(ctx, "books", name)
    }

    pub fn link(&self, ctx: &Context, author: &RowKey, book: &RowKey) -> Result<RowKey, RepoError> {
        let links = table("author_books");
        self.manager.join_or_begin(Some(ctx), |tx| {
            let row = Row::from_value(
                RowKey::generate(),
                json!({ "author_id": author.as_str(), "book_id": book.as_str() }),
            )?;
            tx.insert(&links, &row)?;
            Ok(row.key)
        })
    }

    /// Committed rows of `collection`.
    pub fn committed(&self, collection: &str) -> Vec<Row> {
        let store = self.manager.backend().store();
        store.scan_table(&table(collection), store.head().unwrap()).unwrap()
    }

    pub fn find_committed(&self, collection: &str, name: &str) -> Option<Row> {
        self.committed(collection)
            .into_iter()
            .find(|row| row.get_str("name") == Some(name))
    }
}
