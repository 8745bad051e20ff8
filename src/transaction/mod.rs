//! Transaction management for txscope.
//!
//! A unit of work runs inside exactly one transaction. The manager begins
//! it, exposes it to the unit of work through the context, and then commits
//! or rolls back exactly once depending on what the work did: returned a
//! value, returned an error, panicked, or outlived its context.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TxManager                            │
//! │  (Begins, finalizes, races against cancellation, tracks)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │  Backend    │       │  TxHandle   │       │  carrier    │
//!  │ (sqlite,git)│       │ (open slot) │       │ (Context)   │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txscope::backends::sqlite::{SqliteBackend, SqliteConfig};
//! use txscope::context::Context;
//! use txscope::transaction::TxManager;
//!
//! let manager = TxManager::new(SqliteBackend::new(SqliteConfig::new("app.db")));
//!
//! manager.with_transaction(&Context::background(), |ctx| {
//!     // Both calls join the transaction carried by `ctx`.
//!     authors.create(ctx, "John")?;
//!     books.create(ctx, "Foundation")?;
//!     Ok(())
//! })?;
//! ```

mod backend;
pub mod carrier;
mod config;
mod error;
mod handle;
mod manager;

pub use backend::Backend;
pub use config::ManagerConfig;
pub use error::{BoxError, TransactionError, TransactionResult};
pub use handle::{TxHandle, TxState};
pub use manager::{Finalization, ManagerStats, RollbackCause, TransactionInfo, TxManager};
