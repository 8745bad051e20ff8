//! The shared slot through which collaborators reach an open transaction.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transaction::error::{TransactionError, TransactionResult};

/// Lifecycle state of one transaction.
///
/// `Begun` is the only non-terminal state. A handle exists only once the
/// engine has begun the transaction, so there is no idle state here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Begun,
    Committed,
    RolledBack,
}

impl TxState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxState::Begun)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxState::Begun => "begun",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled back",
        };
        f.write_str(s)
    }
}

enum Slot<T> {
    Open(T),
    Closed(TxState),
}

struct HandleInner<T> {
    id: String,
    backend: &'static str,
    slot: Mutex<Slot<T>>,
}

/// Borrowable reference to one open engine transaction.
///
/// Clones share the same transaction. The transaction itself stays owned by
/// the manager invocation that began it: collaborators can only run code
/// against it through [`TxHandle::with`], and once the manager finalizes it
/// every clone reports [`TransactionError::NotActive`].
pub struct TxHandle<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Clone for TxHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> TxHandle<T> {
    pub(crate) fn new(id: String, backend: &'static str, tx: T) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                backend,
                slot: Mutex::new(Slot::Open(tx)),
            }),
        }
    }

    /// Transaction id, unique per invocation.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Name of the backend that began the transaction.
    pub fn backend(&self) -> &'static str {
        self.inner.backend
    }

    pub fn state(&self) -> TxState {
        match &*self.inner.slot.lock() {
            Slot::Open(_) => TxState::Begun,
            Slot::Closed(state) => *state,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxState::Begun
    }

    /// Check if two handles refer to the same transaction.
    pub fn same_transaction(&self, other: &TxHandle<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` against the open transaction.
    ///
    /// Calls are serialized: a second thread blocks until the first returns,
    /// and finalization waits for any call in progress. Not reentrant.
    pub fn with<R, F>(&self, f: F) -> TransactionResult<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut slot = self.inner.slot.lock();
        match &mut *slot {
            Slot::Open(tx) => Ok(f(tx)),
            Slot::Closed(state) => Err(TransactionError::NotActive {
                tx_id: self.inner.id.clone(),
                state: *state,
            }),
        }
    }

    /// Take the transaction out for finalization, leaving `state` behind.
    ///
    /// Returns `None` if it was already taken; exactly one caller ever gets it.
    pub(crate) fn close(&self, state: TxState) -> Option<T> {
        debug_assert!(state.is_terminal());
        let mut slot = self.inner.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Closed(state)) {
            Slot::Open(tx) => Some(tx),
            Slot::Closed(previous) => {
                *slot = Slot::Closed(previous);
                None
            }
        }
    }

    /// Record the final state after the engine call decided it.
    pub(crate) fn mark(&self, state: TxState) {
        let mut slot = self.inner.slot.lock();
        if let Slot::Closed(current) = &mut *slot {
            *current = state;
        }
    }
}

impl<T> fmt::Debug for TxHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxHandle")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_while_open() {
        let handle = TxHandle::new("tx1".to_string(), "memory", Vec::<u32>::new());
        handle.with(|tx| tx.push(1)).unwrap();
        handle.with(|tx| tx.push(2)).unwrap();

        assert_eq!(handle.with(|tx| tx.clone()).unwrap(), vec![1, 2]);
        assert_eq!(handle.state(), TxState::Begun);
    }

    #[test]
    fn test_close_exactly_once() {
        let handle = TxHandle::new("tx1".to_string(), "memory", 5_u8);
        let alias = handle.clone();

        assert_eq!(handle.close(TxState::Committed), Some(5));
        assert_eq!(alias.close(TxState::RolledBack), None);
        assert_eq!(alias.state(), TxState::Committed);
    }

    #[test]
    fn test_stale_handle_reports_not_active() {
        let handle = TxHandle::new("tx1".to_string(), "memory", ());
        let leaked = handle.clone();
        handle.close(TxState::RolledBack);

        let err = leaked.with(|_| ()).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::NotActive { state: TxState::RolledBack, .. }
        ));
        assert!(!leaked.is_active());
    }

    #[test]
    fn test_mark_overrides_closed_state() {
        let handle = TxHandle::new("tx1".to_string(), "memory", ());
        handle.close(TxState::Committed);
        handle.mark(TxState::RolledBack);
        assert_eq!(handle.state(), TxState::RolledBack);
    }

    #[test]
    fn test_same_transaction() {
        let a = TxHandle::new("a".to_string(), "memory", ());
        let b = TxHandle::new("b".to_string(), "memory", ());
        assert!(a.same_transaction(&a.clone()));
        assert!(!a.same_transaction(&b));
    }
}
