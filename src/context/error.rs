//! Context error types.

use thiserror::Error;

/// Why a [`Context`](super::Context) is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context, or one of its ancestors, was cancelled explicitly.
    #[error("context cancelled")]
    Cancelled,

    /// The earliest deadline in the context chain has passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl ContextError {
    /// Check if this error came from a deadline rather than an explicit cancel.
    pub fn is_deadline(&self) -> bool {
        matches!(self, ContextError::DeadlineExceeded)
    }
}
