//! Git document-store adapter.
//!
//! A transaction is a branch: `begin` forks `tx/{id}` off main, writes
//! commit onto that branch, `commit` fast-forwards main to it and `rollback`
//! throws it away. Commit fails with `ConcurrentModification` if another
//! transaction moved main in the meantime; the branch is dropped either way.

use std::fmt;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::context::ContextKey;
use crate::storage::{BranchName, CommitId, GitStore, Row, RowKey, StorageError, StorageResult, TableName};
use crate::transaction::Backend;

/// An open document-store transaction.
pub struct GitTx {
    store: GitStore,
    id: String,
    branch: BranchName,
    base: CommitId,
}

impl GitTx {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The branch the writes land on.
    pub fn branch(&self) -> &BranchName {
        &self.branch
    }

    /// Main's head when the transaction began.
    pub fn base(&self) -> CommitId {
        self.base
    }

    fn tip(&self) -> StorageResult<CommitId> {
        self.store.resolve_branch(&self.branch)
    }

    pub fn insert(&mut self, table: &TableName, row: &Row) -> StorageResult<()> {
        self.store.insert_row(&self.branch, table, row, Some(self.id.as_str()))?;
        Ok(())
    }

    pub fn update(&mut self, table: &TableName, row: &Row) -> StorageResult<()> {
        self.store.update_row(&self.branch, table, row, Some(self.id.as_str()))?;
        Ok(())
    }

    pub fn delete(&mut self, table: &TableName, key: &RowKey) -> StorageResult<()> {
        self.store.delete_row(&self.branch, table, key, Some(self.id.as_str()))?;
        Ok(())
    }

    /// Read a row, seeing this transaction's own writes.
    pub fn read(&self, table: &TableName, key: &RowKey) -> StorageResult<Option<Row>> {
        self.store.read_row(table, key, self.tip()?)
    }

    pub fn scan(&self, table: &TableName) -> StorageResult<Vec<Row>> {
        self.store.scan_table(table, self.tip()?)
    }
}

impl fmt::Debug for GitTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitTx")
            .field("id", &self.id)
            .field("branch", &self.branch)
            .field("base", &self.base.short())
            .finish()
    }
}

pub struct GitBackend {
    store: GitStore,
    key: ContextKey,
}

impl GitBackend {
    pub fn new(store: GitStore) -> Self {
        Self {
            store,
            key: ContextKey::new("git.tx"),
        }
    }

    pub fn store(&self) -> &GitStore {
        &self.store
    }

    fn discard(&self, tx: &GitTx) -> StorageResult<()> {
        self.store.delete_branch(&tx.branch)
    }
}

impl fmt::Debug for GitBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitBackend")
            .field("store", &self.store)
            .field("key", &self.key)
            .finish()
    }
}

impl Backend for GitBackend {
    type Tx = GitTx;
    type Error = StorageError;

    fn name(&self) -> &'static str {
        "git"
    }

    fn key(&self) -> &ContextKey {
        &self.key
    }

    fn begin(&self) -> StorageResult<GitTx> {
        let base = self.store.head()?;
        let id = Ulid::new().to_string().to_lowercase();
        let branch = self.store.create_transaction_branch(&id, base)?;
        debug!(branch = %branch, base = %base.short(), "git transaction begun");

        Ok(GitTx {
            store: self.store.clone(),
            id,
            branch,
            base,
        })
    }

    fn commit(&self, tx: GitTx) -> StorageResult<()> {
        let published = match tx.tip() {
            // Nothing written: main stays where it is, whoever moved it.
            Ok(tip) if tip == tx.base => Ok(()),
            Ok(_) => self.store.fast_forward_main(&tx.branch, tx.base).map(|_| ()),
            Err(e) => Err(e),
        };

        if let Err(e) = self.discard(&tx) {
            warn!(branch = %tx.branch, error = %e, "failed to delete transaction branch");
        }
        published
    }

    fn rollback(&self, tx: GitTx) -> StorageResult<()> {
        self.discard(&tx)
    }
}
