//! Git-backed document store.
//!
//! Tables are directories, rows are JSON files, and every write is a commit.
//! Writes never touch `main` directly: they land on a transaction branch
//! (`tx/{id}`) that is fast-forwarded onto `main` when the transaction
//! commits, and simply deleted when it rolls back.
//!
//! # Architecture
//!
//! ```text
//!   main ──●──────────────●   fast_forward_main (only if main is still at base)
//!           \            ╱
//!   tx/{id}  ●──●──●────╯     insert_row / update_row / delete_row
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txscope::storage::{GitStore, Row, RowKey, TableName};
//!
//! let store = GitStore::open_or_init("./documents")?;
//! let base = store.head()?;
//! let branch = store.create_transaction_branch("t1", base)?;
//!
//! let authors = TableName::new("authors")?;
//! let row = Row::from_value(RowKey::generate(), json!({"name": "John"}))?;
//! store.insert_row(&branch, &authors, &row, Some("t1"))?;
//!
//! store.fast_forward_main(&branch, base)?;
//! store.delete_branch(&branch)?;
//! ```

mod error;
mod row;
mod store;
mod types;

pub use error::{StorageError, StorageResult};
pub use row::Row;
pub use store::{GitStore, GitStoreConfig};
pub use types::{BranchName, CommitId, GitSignature, InvalidNameError, RowKey, TableName};
