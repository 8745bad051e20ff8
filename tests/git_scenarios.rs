mod common;

use std::thread;

use common::*;
use txscope::context::Context;
use txscope::storage::StorageError;
use txscope::transaction::TransactionError;

#[test]
fn scenario_a_documents_commit_together() {
    let (_dir, manager) = git_setup();
    let docs = Documents::new(&manager);

    let result: Result<(), RepoError> = manager.with_transaction(&Context::background(), |ctx| {
        let author = docs.add_author(ctx, "john")?;
        let book = docs.add_book(ctx, "Math")?;
        docs.link(ctx, &author, &book)?;

        assert!(docs.committed("authors").is_empty());
        Ok(())
    });
    result.unwrap();

    let author = docs.find_committed("authors", "john").unwrap();
    let book = docs.find_committed("books", "Math").unwrap();
    let links = docs.committed("author_books");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].get_str("author_id"), Some(author.key.as_str()));
    assert_eq!(links[0].get_str("book_id"), Some(book.key.as_str()));
    assert!(manager.backend().store().transaction_branches().unwrap().is_empty());
}

#[test]
fn scenario_b_duplicate_leaves_main_untouched() {
    let (_dir, manager) = git_setup();
    let docs = Documents::new(&manager);
    docs.add_author(&Context::background(), "john").unwrap();
    let before = manager.backend().store().head().unwrap();

    let result: Result<(), RepoError> = manager.with_transaction(&Context::background(), |ctx| {
        let book = docs.add_book(ctx, "Biology")?;
        let author = docs.add_author(ctx, "john")?;
        docs.link(ctx, &author, &book)?;
        Ok(())
    });

    assert!(matches!(result, Err(RepoError::Duplicate(ref name)) if name == "john"));
    assert_eq!(manager.backend().store().head().unwrap(), before);
    assert!(docs.find_committed("books", "Biology").is_none());
    assert!(docs.committed("author_books").is_empty());
    assert!(manager.backend().store().transaction_branches().unwrap().is_empty());
}

#[test]
fn scenario_c_panic_discards_branch() {
    let (_dir, manager) = git_setup();
    let docs = Documents::new(&manager);

    let result: Result<(), RepoError> = manager.with_transaction(&Context::background(), |ctx| {
        docs.add_book(ctx, "Biology")?;
        let missing: Option<&str> = None;
        docs.add_author(ctx, missing.unwrap())?;
        Ok(())
    });

    assert!(result.unwrap_err().is_panic());
    assert!(docs.committed("books").is_empty());
    assert!(manager.backend().store().transaction_branches().unwrap().is_empty());
}

#[test]
fn conflicting_transactions_first_commit_wins() {
    let (_dir, manager) = git_setup();
    let docs = Documents::new(&manager);

    let result: Result<(), RepoError> = manager.with_transaction(&Context::background(), |ctx| {
        docs.add_book(ctx, "Math")?;

        // Another caller commits while this transaction is still open.
        let other_manager = manager.clone();
        thread::spawn(move || {
            Documents::new(&other_manager)
                .add_author(&Context::background(), "jane")
                .unwrap();
        })
        .join()
        .unwrap();
        Ok(())
    });

    match result {
        Err(RepoError::Tx(TransactionError::Commit { source, .. })) => {
            let storage = source.downcast_ref::<StorageError>().unwrap();
            assert!(storage.is_conflict());
        }
        other => panic!("expected a commit conflict, got {other:?}"),
    }
    assert!(docs.find_committed("authors", "jane").is_some());
    assert!(docs.committed("books").is_empty());

    let stats = manager.stats();
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.commit_failures, 1);
    assert!(manager.backend().store().transaction_branches().unwrap().is_empty());
}
