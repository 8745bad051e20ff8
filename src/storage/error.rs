//! Storage layer error types

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::{InvalidNameError, RowKey, TableName};

/// The main error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("row not found: table={table}, key={key}")]
    RowNotFound { table: TableName, key: RowKey },

    /// duplicate primary key
    #[error("row already exists: table={table}, key={key}")]
    RowAlreadyExists { table: TableName, key: RowKey },

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("branch already exists: {0}")]
    BranchAlreadyExists(String),

    /// main moved since the transaction branch was created
    #[error("concurrent modification: branch {branch} was updated by another transaction")]
    ConcurrentModification { branch: String },

    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: PathBuf, reason: String },

    #[error("unexpected entry type at {path}: expected {expected}")]
    UnexpectedEntryType { path: PathBuf, expected: &'static str },

    #[error("repository not initialized: {0}")]
    NotInitialized(PathBuf),

    #[error("repository is empty: no commits found")]
    EmptyRepository,

    #[error("schema violation: {0}")]
    SchemaViolation(String),
}

impl StorageError {
    /// Check if this error indicates the resource doesn't exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::RowNotFound { .. } | StorageError::RefNotFound(_)
        )
    }

    /// Check if this error is a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::RowAlreadyExists { .. }
                | StorageError::BranchAlreadyExists(_)
                | StorageError::ConcurrentModification { .. }
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
