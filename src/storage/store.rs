//! The git-backed document store.
//!
//! Wraps `git2::Repository` behind a mutex and exposes the operations the
//! transaction layer needs: branch lifecycle, row reads at a commit, and row
//! writes that append one commit to a branch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{BranchType, ErrorCode, FileMode, ObjectType, Repository, RepositoryInitOptions, Tree};
use parking_lot::Mutex;
use tracing::debug;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::row::{self, Row};
use crate::storage::types::{BranchName, CommitId, GitSignature, RowKey, TableName};

/// Options for opening a [`GitStore`].
#[derive(Debug, Clone)]
pub struct GitStoreConfig {
    /// Path to the repository directory.
    pub path: PathBuf,
    /// Initialize the repository if it doesn't exist.
    pub create_if_missing: bool,
    /// Author and committer of every commit.
    pub signature: GitSignature,
}

impl Default for GitStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".txscope"),
            create_if_missing: true,
            signature: GitSignature::default(),
        }
    }
}

impl GitStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }
}

/// Row mutation applied to a branch.
enum Write<'a> {
    Insert(&'a Row),
    Update(&'a Row),
    Delete(&'a RowKey),
}

impl Write<'_> {
    fn key(&self) -> &RowKey {
        match self {
            Write::Insert(row) | Write::Update(row) => &row.key,
            Write::Delete(key) => key,
        }
    }

    fn message(&self, table: &TableName, tx_id: Option<&str>) -> String {
        let op = match self {
            Write::Insert(_) => "INSERT",
            Write::Update(_) => "UPDATE",
            Write::Delete(_) => "DELETE",
        };
        match tx_id {
            Some(id) => format!("[{}] {}/{} tx:{}", op, table, self.key(), id),
            None => format!("[{}] {}/{}", op, table, self.key()),
        }
    }
}

/// Git repository holding the documents.
///
/// Clone this to share across threads - it uses Arc internally. Access to
/// the repository is serialized.
#[derive(Clone)]
pub struct GitStore {
    inner: Arc<GitStoreInner>,
}

struct GitStoreInner {
    repo: Mutex<Repository>,
    path: PathBuf,
    signature: GitSignature,
}

impl GitStore {
    /// Open or create the store described by `config`.
    pub fn from_config(config: GitStoreConfig) -> StorageResult<Self> {
        if config.create_if_missing {
            Self::open_or_init_with(&config.path, config.signature)
        } else {
            Self::open_with(&config.path, config.signature)
        }
    }

    /// Open an existing store.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with(path.as_ref(), GitSignature::default())
    }

    /// Initialize a new store with an empty initial commit on `main`.
    pub fn init(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::init_with(path.as_ref(), GitSignature::default())
    }

    pub fn open_or_init(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_or_init_with(path.as_ref(), GitSignature::default())
    }

    fn open_or_init_with(path: &Path, signature: GitSignature) -> StorageResult<Self> {
        if path.join(".git").exists() {
            Self::open_with(path, signature)
        } else {
            Self::init_with(path, signature)
        }
    }

    fn open_with(path: &Path, signature: GitSignature) -> StorageResult<Self> {
        let repo =
            Repository::open(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;
        Ok(Self::wrap(repo, path, signature))
    }

    fn init_with(path: &Path, signature: GitSignature) -> StorageResult<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(BranchName::MAIN);
        let repo = Repository::init_opts(path, &opts)?;

        {
            let empty_tree = repo.find_tree(repo.treebuilder(None)?.write()?)?;
            let sig = signature.to_git2()?;
            let main = BranchName::main().as_ref_path();
            repo.commit(Some(main.as_str()), &sig, &sig, "[txscope] Initialize store", &empty_tree, &[])?;
        }

        debug!(path = %path.display(), "initialized document store");
        Ok(Self::wrap(repo, path, signature))
    }

    fn wrap(repo: Repository, path: &Path, signature: GitSignature) -> Self {
        Self {
            inner: Arc::new(GitStoreInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                signature,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    // ==================== Branch Operations ====================

    /// Tip of the main branch.
    pub fn head(&self) -> StorageResult<CommitId> {
        self.resolve_branch(&BranchName::main())
    }

    pub fn resolve_branch(&self, branch: &BranchName) -> StorageResult<CommitId> {
        self.with_repo(|repo| resolve(repo, branch))
    }

    pub fn branch_exists(&self, branch: &BranchName) -> StorageResult<bool> {
        self.with_repo(|repo| Ok(repo.find_reference(&branch.as_ref_path()).is_ok()))
    }

    /// Create `tx/{tx_id}` pointing at `base`.
    pub fn create_transaction_branch(&self, tx_id: &str, base: CommitId) -> StorageResult<BranchName> {
        let branch = BranchName::for_transaction(tx_id);
        self.with_repo(|repo| {
            let commit = repo.find_commit(base.raw())?;
            repo.branch(branch.as_str(), &commit, false).map_err(|e| {
                if e.code() == ErrorCode::Exists {
                    StorageError::BranchAlreadyExists(branch.to_string())
                } else {
                    StorageError::Git(e)
                }
            })?;
            Ok(())
        })?;
        Ok(branch)
    }

    pub fn delete_branch(&self, branch: &BranchName) -> StorageResult<()> {
        self.with_repo(|repo| delete(repo, branch))
    }

    /// All `tx/` branches currently present.
    pub fn transaction_branches(&self) -> StorageResult<Vec<BranchName>> {
        self.with_repo(|repo| {
            let mut result = Vec::new();
            for entry in repo.branches(Some(BranchType::Local))? {
                let (branch, _) = entry?;
                if let Some(name) = branch.name()? {
                    if let Ok(name) = BranchName::new(name) {
                        if name.is_transaction_branch() {
                            result.push(name);
                        }
                    }
                }
            }
            Ok(result)
        })
    }

    /// Delete every transaction branch.
    ///
    /// Branches are left behind only by a process that died mid-transaction;
    /// call this at startup before any transaction is opened.
    pub fn prune_transaction_branches(&self) -> StorageResult<usize> {
        let branches = self.transaction_branches()?;
        let mut deleted = 0;
        for branch in &branches {
            self.delete_branch(branch)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Move main to the tip of `tx_branch`, only if main still is `expected_main`.
    pub fn fast_forward_main(&self, tx_branch: &BranchName, expected_main: CommitId) -> StorageResult<CommitId> {
        self.with_repo(|repo| {
            let main = BranchName::main();
            let target = resolve(repo, tx_branch)?;
            let current = resolve(repo, &main)?;
            if current != expected_main {
                return Err(StorageError::ConcurrentModification {
                    branch: main.to_string(),
                });
            }

            let mut reference = repo.find_reference(&main.as_ref_path())?;
            reference.set_target(target.raw(), &format!("fast-forward from {}", tx_branch))?;
            Ok(target)
        })
    }

    // ==================== Row Operations ====================

    pub fn read_row(&self, table: &TableName, key: &RowKey, at: CommitId) -> StorageResult<Option<Row>> {
        self.with_repo(|repo| {
            let root = repo.find_commit(at.raw())?.tree()?;
            let Some(table_tree) = table_tree(repo, &root, table)? else {
                return Ok(None);
            };
            let found = match table_tree.get_name(&key.file_name()) {
                Some(entry) => {
                    let blob = repo.find_blob(entry.id())?;
                    Some(row::decode(blob.content(), key)?)
                }
                None => None,
            };
            Ok(found)
        })
    }

    /// All rows of `table` at `at`, ordered by key. A table never written
    /// to is empty.
    pub fn scan_table(&self, table: &TableName, at: CommitId) -> StorageResult<Vec<Row>> {
        self.with_repo(|repo| {
            let root = repo.find_commit(at.raw())?.tree()?;
            let Some(table_tree) = table_tree(repo, &root, table)? else {
                return Ok(Vec::new());
            };

            let mut rows = Vec::with_capacity(table_tree.len());
            for entry in table_tree.iter() {
                if entry.kind() != Some(ObjectType::Blob) {
                    continue;
                }
                let Some(key) = entry.name().and_then(RowKey::from_file_name) else {
                    continue;
                };
                let blob = repo.find_blob(entry.id())?;
                rows.push(row::decode(blob.content(), &key)?);
            }
            Ok(rows)
        })
    }

    /// Insert a new row on `branch`. Fails if the key is taken.
    pub fn insert_row(&self, branch: &BranchName, table: &TableName, row: &Row, tx_id: Option<&str>) -> StorageResult<CommitId> {
        self.write(branch, table, Write::Insert(row), tx_id)
    }

    /// Replace an existing row on `branch`.
    pub fn update_row(&self, branch: &BranchName, table: &TableName, row: &Row, tx_id: Option<&str>) -> StorageResult<CommitId> {
        self.write(branch, table, Write::Update(row), tx_id)
    }

    pub fn delete_row(&self, branch: &BranchName, table: &TableName, key: &RowKey, tx_id: Option<&str>) -> StorageResult<CommitId> {
        self.write(branch, table, Write::Delete(key), tx_id)
    }

    /// Apply one mutation as one commit on top of `branch`.
    fn write(&self, branch: &BranchName, table: &TableName, write: Write<'_>, tx_id: Option<&str>) -> StorageResult<CommitId> {
        self.with_repo(|repo| {
            let parent = repo.find_commit(resolve(repo, branch)?.raw())?;
            let root = parent.tree()?;
            let existing = table_tree(repo, &root, table)?;
            let key = write.key();
            let exists = existing
                .as_ref()
                .is_some_and(|tree| tree.get_name(&key.file_name()).is_some());

            let mut table_builder = repo.treebuilder(existing.as_ref())?;
            match &write {
                Write::Insert(_) if exists => {
                    return Err(StorageError::RowAlreadyExists {
                        table: table.clone(),
                        key: key.clone(),
                    })
                }
                Write::Update(_) | Write::Delete(_) if !exists => {
                    return Err(StorageError::RowNotFound {
                        table: table.clone(),
                        key: key.clone(),
                    })
                }
                Write::Insert(doc) | Write::Update(doc) => {
                    let blob = repo.blob(&row::encode(doc)?)?;
                    table_builder.insert(key.file_name(), blob, FileMode::Blob.into())?;
                }
                Write::Delete(_) => table_builder.remove(key.file_name())?,
            }

            let mut root_builder = repo.treebuilder(Some(&root))?;
            root_builder.insert(table.as_str(), table_builder.write()?, FileMode::Tree.into())?;
            let tree = repo.find_tree(root_builder.write()?)?;

            let sig = self.inner.signature.to_git2()?;
            let oid = repo.commit(
                Some(branch.as_ref_path().as_str()),
                &sig,
                &sig,
                &write.message(table, tx_id),
                &tree,
                &[&parent],
            )?;
            Ok(CommitId::new(oid))
        })
    }
}

impl std::fmt::Debug for GitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitStore").field("path", &self.inner.path).finish()
    }
}

fn resolve(repo: &Repository, branch: &BranchName) -> StorageResult<CommitId> {
    let reference = repo.find_reference(&branch.as_ref_path()).map_err(|e| {
        if e.code() == ErrorCode::NotFound && branch.as_str() == BranchName::MAIN {
            StorageError::EmptyRepository
        } else {
            StorageError::RefNotFound(branch.to_string())
        }
    })?;
    let commit = reference
        .peel_to_commit()
        .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;
    Ok(CommitId::new(commit.id()))
}

fn delete(repo: &Repository, branch: &BranchName) -> StorageResult<()> {
    let mut git_branch = repo
        .find_branch(branch.as_str(), BranchType::Local)
        .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;
    git_branch.delete()?;
    Ok(())
}

/// The directory tree of `table`, if the table has ever been written to.
fn table_tree<'r>(repo: &'r Repository, root: &Tree<'r>, table: &TableName) -> StorageResult<Option<Tree<'r>>> {
    match root.get_name(table.as_str()) {
        None => Ok(None),
        Some(entry) if entry.kind() == Some(ObjectType::Tree) => Ok(Some(repo.find_tree(entry.id())?)),
        Some(_) => Err(StorageError::UnexpectedEntryType {
            path: table.as_str().into(),
            expected: "tree (directory)",
        }),
    }
}
