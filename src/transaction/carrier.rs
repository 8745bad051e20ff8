//! Carries the ambient transaction handle inside a [`Context`].
//!
//! The manager attaches the handle it opened; any data-access code running
//! under that context looks it up and joins the transaction instead of
//! opening its own. A failed lookup is never an error: callers fall back to
//! a transaction of their own.

use std::any::Any;

use tracing::warn;

use crate::context::{Context, ContextKey};
use crate::transaction::handle::TxHandle;

/// Derive a context carrying `handle` under `key`.
///
/// `ctx` itself is left untouched.
pub fn attach<T>(ctx: &Context, key: &ContextKey, handle: TxHandle<T>) -> Context
where
    T: Send + 'static,
{
    ctx.with_value(key, handle)
}

/// Find the transaction handle bound under `key`.
///
/// Returns `None` when there is no context, the key is not bound, or the
/// bound value is not a `TxHandle<T>`. The last case is logged as a warning.
pub fn lookup<T>(ctx: Option<&Context>, key: &ContextKey) -> Option<TxHandle<T>>
where
    T: Send + 'static,
{
    let ctx = ctx?;
    let value: &(dyn Any + Send + Sync) = ctx.value(key)?;

    match value.downcast_ref::<TxHandle<T>>() {
        Some(handle) => Some(handle.clone()),
        None => {
            warn!(
                key = %key,
                want = std::any::type_name::<TxHandle<T>>(),
                got = ctx.value_type_name(key).unwrap_or("unknown"),
                "invalid type bound under transaction key"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn handle(id: &str) -> TxHandle<Vec<u8>> {
        TxHandle::new(id.to_string(), "memory", Vec::new())
    }

    #[test]
    fn test_lookup_without_context() {
        let key = ContextKey::new("tx");
        assert!(lookup::<Vec<u8>>(None, &key).is_none());
    }

    #[test]
    fn test_lookup_on_empty_context() {
        let key = ContextKey::new("tx");
        let ctx = Context::background();
        assert!(lookup::<Vec<u8>>(Some(&ctx), &key).is_none());
    }

    #[test]
    fn test_lookup_with_other_key() {
        let key = ContextKey::new("tx");
        let other = ContextKey::new("tx");
        let ctx = attach(&Context::background(), &other, handle("a"));
        assert!(lookup::<Vec<u8>>(Some(&ctx), &key).is_none());
    }

    #[test]
    fn test_lookup_with_invalid_type() {
        let key = ContextKey::new("tx");
        let ctx = Context::background().with_value(&key, 1_i32);
        assert!(lookup::<Vec<u8>>(Some(&ctx), &key).is_none());
    }

    #[test]
    fn test_lookup_with_handle_of_other_backend_type() {
        let key = ContextKey::new("tx");
        let ctx = attach(&Context::background(), &key, TxHandle::new("b".into(), "other", 0_u64));
        assert!(lookup::<Vec<u8>>(Some(&ctx), &key).is_none());
        assert!(lookup::<u64>(Some(&ctx), &key).is_some());
    }

    #[test]
    fn test_attach_then_lookup() {
        let key = ContextKey::new("tx");
        let parent = Context::background();
        let h = handle("a");
        let child = attach(&parent, &key, h.clone());

        let found = lookup::<Vec<u8>>(Some(&child), &key).unwrap();
        assert!(found.same_transaction(&h));
        assert!(lookup::<Vec<u8>>(Some(&parent), &key).is_none());
    }

    #[test]
    fn test_two_backends_share_one_chain() {
        let sql_key = ContextKey::new("sql");
        let doc_key = ContextKey::new("doc");
        let sql = TxHandle::new("s".into(), "sql", 1_u32);
        let doc = handle("d");

        let ctx = attach(&Context::background(), &sql_key, sql.clone());
        let ctx = attach(&ctx, &doc_key, doc.clone());

        assert!(lookup::<u32>(Some(&ctx), &sql_key).unwrap().same_transaction(&sql));
        assert!(lookup::<Vec<u8>>(Some(&ctx), &doc_key).unwrap().same_transaction(&doc));
        assert!(lookup::<u32>(Some(&ctx), &doc_key).is_none());
    }

    proptest! {
        #[test]
        fn prop_attach_never_changes_parent(depth in 0usize..8, attach_at in 0usize..8) {
            let key = ContextKey::new("tx");
            let filler = ContextKey::new("filler");
            let mut ctx = Context::background();
            for i in 0..depth {
                ctx = ctx.with_value(&filler, i);
            }

            let h = handle("p");
            let mut child = attach(&ctx, &key, h.clone());
            for i in 0..attach_at {
                child = child.with_value(&filler, i);
            }

            prop_assert!(lookup::<Vec<u8>>(Some(&ctx), &key).is_none());
            let found = lookup::<Vec<u8>>(Some(&child), &key);
            prop_assert!(found.is_some_and(|f| f.same_transaction(&h)));
        }
    }
}
