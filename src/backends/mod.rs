//! Engines a [`TxManager`](crate::transaction::TxManager) can drive.
//!
//! - [`sqlite`]: relational, one connection per transaction
//! - [`git`]: the document store in [`crate::storage`], one branch per transaction

pub mod git;
pub mod sqlite;

pub use git::{GitBackend, GitTx};
pub use sqlite::{BeginMode, SqliteBackend, SqliteConfig, SqliteError, SqliteTx};
