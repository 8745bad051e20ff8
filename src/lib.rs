//! txscope - transaction-scoped units of work
//!
//! Run a closure inside exactly one database transaction. The transaction is
//! carried to everything the closure calls through a [`Context`], so data
//! access spread over several repositories commits or rolls back as one.
//! Errors roll back, panics roll back, and a cancelled or timed-out context
//! rolls back.
//!
//! # Example
//!
//! ```no_run
//! use txscope::backends::{SqliteBackend, SqliteConfig, SqliteError};
//! use txscope::context::Context;
//! use txscope::transaction::{TransactionError, TxManager};
//!
//! #[derive(Debug, thiserror::Error)]
//! enum AppError {
//!     #[error(transparent)]
//!     Sqlite(#[from] SqliteError),
//!     #[error(transparent)]
//!     Tx(#[from] TransactionError),
//! }
//!
//! fn main() -> Result<(), AppError> {
//!     let manager = TxManager::new(SqliteBackend::new(SqliteConfig::new("library.db")));
//!
//!     manager.with_transaction(&Context::background(), |ctx| {
//!         manager.join_or_begin(Some(ctx), |tx| {
//!             tx.execute("INSERT INTO authors (name) VALUES (?1)", ["john"])?;
//!             Ok(())
//!         })
//!     })
//! }
//! ```

pub mod backends;
pub mod context;
pub mod storage;
pub mod transaction;

pub use context::{CancelHandle, Context, ContextError, ContextKey};
pub use transaction::{Backend, TransactionError, TxHandle, TxManager};
