//! Request-scoped context values.
//!
//! A [`Context`] is an immutable chain of key/value bindings plus an optional
//! cancellation signal. Deriving a context never changes the one it was
//! derived from, so a value can be handed to nested calls without anyone
//! being able to alter what the caller sees.
//!
//! ```text
//!   background ──with_value(k1)──▶ ctx1 ──with_cancel──▶ ctx2 ──with_value(k2)──▶ ctx3
//!                                                 │
//!                                           CancelHandle
//! ```
//!
//! Keys are [`ContextKey`] values rather than strings. Every key created with
//! [`ContextKey::new`] is distinct from every other, so unrelated subsystems
//! sharing one chain cannot collide.
//!
//! # Usage
//!
//! ```
//! use txscope::context::{Context, ContextKey};
//!
//! let user = ContextKey::new("request.user");
//! let ctx = Context::background().with_value(&user, String::from("alice"));
//!
//! assert_eq!(ctx.get::<String>(&user).map(String::as_str), Some("alice"));
//! assert!(Context::background().get::<String>(&user).is_none());
//! ```

mod cancel;
mod error;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use cancel::CancelHandle;
pub use error::ContextError;

pub(crate) use cancel::Signal;
use cancel::CancelToken;

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one binding slot in a [`Context`].
///
/// Two keys are equal only if one is a clone of the other. The name is used
/// for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey {
    id: u64,
    name: &'static str,
}

impl ContextKey {
    /// Allocate a new, process-unique key.
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            name,
        }
    }

    /// Diagnostic name given at creation.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

struct Binding {
    parent: Option<Arc<Binding>>,
    key: ContextKey,
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Immutable, append-only, request-scoped value chain.
///
/// Cloning is cheap (two `Arc` bumps). The default value is the empty
/// background context, which is never done.
#[derive(Clone, Default)]
pub struct Context {
    bindings: Option<Arc<Binding>>,
    cancel: Option<CancelToken>,
}

impl Context {
    /// The empty root context.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context with one more binding.
    ///
    /// A binding for a key shadows any earlier binding for the same key.
    pub fn with_value<V>(&self, key: &ContextKey, value: V) -> Self
    where
        V: Any + Send + Sync,
    {
        Self {
            bindings: Some(Arc::new(Binding {
                parent: self.bindings.clone(),
                key: key.clone(),
                value: Arc::new(value),
                type_name: std::any::type_name::<V>(),
            })),
            cancel: self.cancel.clone(),
        }
    }

    fn binding(&self, key: &ContextKey) -> Option<&Binding> {
        let mut current = self.bindings.as_deref();
        while let Some(binding) = current {
            if binding.key == *key {
                return Some(binding);
            }
            current = binding.parent.as_deref();
        }
        None
    }

    /// The nearest value bound under `key`, untyped.
    pub fn value(&self, key: &ContextKey) -> Option<&(dyn Any + Send + Sync)> {
        self.binding(key).map(|b| b.value.as_ref())
    }

    /// Type name of the nearest value bound under `key`.
    pub fn value_type_name(&self, key: &ContextKey) -> Option<&'static str> {
        self.binding(key).map(|b| b.type_name)
    }

    /// The nearest value bound under `key`, if it is a `V`.
    pub fn get<V: Any>(&self, key: &ContextKey) -> Option<&V> {
        self.value(key)?.downcast_ref::<V>()
    }

    /// Derive a context that can be cancelled through the returned handle.
    ///
    /// The new context is also done whenever this one is.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        self.derive_token(None)
    }

    /// Derive a context that is done once `deadline` passes.
    pub fn with_deadline(&self, deadline: Instant) -> (Self, CancelHandle) {
        self.derive_token(Some(deadline))
    }

    /// Derive a context that is done `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancelHandle) {
        self.derive_token(Some(Instant::now() + timeout))
    }

    fn derive_token(&self, deadline: Option<Instant>) -> (Self, CancelHandle) {
        let token = CancelToken::child(self.cancel.as_ref(), deadline);
        let ctx = Self {
            bindings: self.bindings.clone(),
            cancel: Some(token.clone()),
        };
        (ctx, CancelHandle::new(token))
    }

    /// Why this context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        self.cancel.as_ref().and_then(CancelToken::err)
    }

    /// Check whether the context was cancelled or its deadline passed.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Earliest deadline in the chain.
    pub fn deadline(&self) -> Option<Instant> {
        self.cancel.as_ref().and_then(CancelToken::deadline)
    }

    /// Wake `signal` when this context gets cancelled.
    ///
    /// Deadlines do not notify; waiters bound their wait with [`Self::deadline`].
    pub(crate) fn subscribe(&self, signal: &Arc<Signal>) {
        if let Some(token) = &self.cancel {
            token.subscribe(signal);
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = Vec::new();
        let mut current = self.bindings.as_deref();
        while let Some(binding) = current {
            keys.push(binding.key.name);
            current = binding.parent.as_deref();
        }

        f.debug_struct("Context")
            .field("keys", &keys)
            .field("err", &self.err())
            .field("deadline", &self.deadline())
            .finish()
    }
}
