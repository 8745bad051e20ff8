//! Cancellation plumbing behind [`Context::with_cancel`](super::Context::with_cancel).
//!
//! A token only knows its parent. Cancelling a parent therefore does not touch
//! its children; children see it because `err()` walks up the chain, and
//! waiters see it because they subscribe to every token in the chain.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::error::ContextError;

/// Sticky wake-up flag shared between one waiter and everything that may end
/// its wait.
///
/// A `notify` that lands before `wait_until` is not lost.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn notify(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        self.cond.notify_all();
    }

    /// Block until notified or until `deadline` passes.
    ///
    /// Consumes the notification. Returns `true` if woken by `notify`.
    pub(crate) fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut fired = self.fired.lock();
        while !*fired {
            match deadline {
                Some(at) => {
                    if self.cond.wait_until(&mut fired, at).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut fired),
            }
        }
        std::mem::replace(&mut *fired, false)
    }
}

#[derive(Default)]
struct TokenState {
    reason: Option<ContextError>,
    waiters: Vec<Weak<Signal>>,
}

struct TokenInner {
    parent: Option<CancelToken>,
    /// Effective deadline, already folded with the parent's.
    deadline: Option<Instant>,
    state: Mutex<TokenState>,
}

/// One link in a context's cancellation chain.
#[derive(Clone)]
pub(crate) struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub(crate) fn child(parent: Option<&CancelToken>, deadline: Option<Instant>) -> Self {
        let inherited = parent.and_then(|p| p.deadline());
        let deadline = match (inherited, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        Self {
            inner: Arc::new(TokenInner {
                parent: parent.cloned(),
                deadline,
                state: Mutex::new(TokenState::default()),
            }),
        }
    }

    pub(crate) fn cancel(&self) {
        let waiters = {
            let mut state = self.inner.state.lock();
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(ContextError::Cancelled);
            std::mem::take(&mut state.waiters)
        };

        for waiter in waiters.iter().filter_map(Weak::upgrade) {
            waiter.notify();
        }
    }

    pub(crate) fn err(&self) -> Option<ContextError> {
        let mut current = Some(self);
        while let Some(token) = current {
            if let Some(reason) = token.inner.state.lock().reason {
                return Some(reason);
            }
            current = token.inner.parent.as_ref();
        }

        match self.inner.deadline {
            Some(at) if Instant::now() >= at => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Register `signal` with every token in the chain.
    pub(crate) fn subscribe(&self, signal: &Arc<Signal>) {
        let mut current = Some(self);
        while let Some(token) = current {
            let mut state = token.inner.state.lock();
            if state.reason.is_some() {
                drop(state);
                signal.notify();
                return;
            }
            state.waiters.retain(|w| w.strong_count() > 0);
            state.waiters.push(Arc::downgrade(signal));
            drop(state);
            current = token.inner.parent.as_ref();
        }
    }
}

/// Cancels the context returned alongside it by
/// [`Context::with_cancel`](super::Context::with_cancel) and friends.
///
/// Cancelling is idempotent. Dropping the handle does not cancel.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancelToken,
}

impl CancelHandle {
    pub(crate) fn new(token: CancelToken) -> Self {
        Self { token }
    }

    /// Cancel the context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check whether the associated context is done, for any reason.
    pub fn is_cancelled(&self) -> bool {
        self.token.err().is_some()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
