//! Transaction error types.

use std::error::Error as StdError;

use thiserror::Error;

use crate::context::ContextError;
use crate::transaction::handle::TxState;

/// Boxed engine error carried as the source of lifecycle failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors raised by the transaction machinery itself.
///
/// Business errors returned by a unit of work are never wrapped in this type;
/// they come back to the caller as they were returned.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The engine refused to open a transaction.
    #[error("failed to begin transaction on {backend}: {source}")]
    Begin {
        backend: &'static str,
        #[source]
        source: BoxError,
    },

    /// The unit of work succeeded but the engine failed to commit.
    #[error("failed to commit transaction {tx_id}: {source}")]
    Commit {
        tx_id: String,
        #[source]
        source: BoxError,
    },

    /// The engine failed to roll back.
    #[error("failed to rollback transaction {tx_id}: {source}")]
    Rollback {
        tx_id: String,
        #[source]
        source: BoxError,
    },

    /// The handle was used after its transaction was finalized.
    #[error("transaction {tx_id} is no longer active (state: {state})")]
    NotActive { tx_id: String, state: TxState },

    /// The unit of work panicked; the panic was contained and rolled back.
    #[error("panic happened because: {0}")]
    Panicked(String),

    /// The worker thread for a cancellable transaction could not be started.
    #[error("failed to spawn transaction worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// The caller's context was cancelled or timed out.
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl TransactionError {
    /// Check if this error reports a cancelled or timed-out context.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransactionError::Context(_))
    }

    /// Check if this error stands in for a panic in the unit of work.
    pub fn is_panic(&self) -> bool {
        matches!(self, TransactionError::Panicked(_))
    }

    /// The context error, if this is a cancellation.
    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            TransactionError::Context(e) => Some(*e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let cancelled = TransactionError::from(ContextError::Cancelled);
        assert!(cancelled.is_cancellation());
        assert!(!cancelled.is_panic());
        assert_eq!(cancelled.context_error(), Some(ContextError::Cancelled));

        let panicked = TransactionError::Panicked("boom".to_string());
        assert!(panicked.is_panic());
        assert!(!panicked.is_cancellation());
        assert_eq!(panicked.to_string(), "panic happened because: boom");
    }

    #[test]
    fn test_not_active_message() {
        let err = TransactionError::NotActive {
            tx_id: "01hx".to_string(),
            state: TxState::Committed,
        };
        assert_eq!(
            err.to_string(),
            "transaction 01hx is no longer active (state: committed)"
        );
    }
}
