//! The capability set an engine must provide to be driven by a
//! [`TxManager`](crate::transaction::TxManager).

use crate::context::{Context, ContextKey};
use crate::transaction::carrier;
use crate::transaction::handle::TxHandle;

/// A transactional storage engine.
///
/// Implementations only open and close transactions; deciding *which* of
/// commit or rollback to issue is the manager's job, so the finalization
/// rules exist once for every engine.
///
/// Each instance owns its own [`ContextKey`]. Two instances of the same
/// engine type (say, two databases) never see each other's ambient
/// transaction.
pub trait Backend: Send + Sync + 'static {
    /// The engine's open-transaction object.
    type Tx: Send + 'static;

    /// Engine error for begin / commit / rollback.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short name used in logs and handle metadata.
    fn name(&self) -> &'static str;

    /// Key under which this instance's transactions are carried.
    fn key(&self) -> &ContextKey;

    fn begin(&self) -> Result<Self::Tx, Self::Error>;

    fn commit(&self, tx: Self::Tx) -> Result<(), Self::Error>;

    fn rollback(&self, tx: Self::Tx) -> Result<(), Self::Error>;

    /// Derive a context carrying `handle` as this backend's ambient transaction.
    fn attach(&self, ctx: &Context, handle: TxHandle<Self::Tx>) -> Context {
        carrier::attach(ctx, self.key(), handle)
    }

    /// This backend's ambient transaction in `ctx`, if any.
    fn lookup(&self, ctx: Option<&Context>) -> Option<TxHandle<Self::Tx>> {
        carrier::lookup(ctx, self.key())
    }
}
