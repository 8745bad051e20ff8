//! Transaction manager - runs units of work inside exactly one transaction.
//!
//! The TransactionManager is the main entry point for transactions.
//! It handles:
//! - Opening a transaction and exposing it through the context
//! - Finalizing it exactly once, whatever the unit of work did
//! - Racing the unit of work against cancellation of the caller's context
//! - Tracking in-flight transactions

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::context::{Context, ContextError, ContextKey, Signal};
use crate::transaction::backend::Backend;
use crate::transaction::config::ManagerConfig;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::handle::{TxHandle, TxState};

/// Why a transaction was rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackCause {
    /// The unit of work returned an error.
    Error,
    /// The unit of work panicked.
    Panic,
    /// The caller's context was done before the outcome was recorded.
    Cancelled,
    /// The engine rejected the commit.
    CommitFailed,
}

/// How a transaction ended. Exactly one per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    Committed,
    RolledBack(RollbackCause),
}

/// Metadata about an in-flight transaction.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub tx_id: String,
    pub backend: &'static str,
    pub started_at: DateTime<Utc>,
}

/// Counters over the lifetime of one manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back_on_error: u64,
    pub rolled_back_on_panic: u64,
    pub rolled_back_on_cancel: u64,
    pub commit_failures: u64,
    pub rollback_failures: u64,
}

impl ManagerStats {
    /// Transactions that ended without committing.
    pub fn rolled_back(&self) -> u64 {
        self.rolled_back_on_error
            + self.rolled_back_on_panic
            + self.rolled_back_on_cancel
            + self.commit_failures
    }

    /// Transactions that reached a terminal state.
    pub fn finalized(&self) -> u64 {
        self.committed + self.rolled_back()
    }
}

impl fmt::Display for ManagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Transaction Statistics:")?;
        writeln!(f, "  Begun: {}", self.begun)?;
        writeln!(f, "  Committed: {}", self.committed)?;
        writeln!(f, "  Rolled Back (error): {}", self.rolled_back_on_error)?;
        writeln!(f, "  Rolled Back (panic): {}", self.rolled_back_on_panic)?;
        writeln!(f, "  Rolled Back (cancelled): {}", self.rolled_back_on_cancel)?;
        writeln!(f, "  Commit Failures: {}", self.commit_failures)?;
        writeln!(f, "  Rollback Failures: {}", self.rollback_failures)
    }
}

#[derive(Default)]
struct Counters {
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back_on_error: AtomicU64,
    rolled_back_on_panic: AtomicU64,
    rolled_back_on_cancel: AtomicU64,
    commit_failures: AtomicU64,
    rollback_failures: AtomicU64,
}

impl Counters {
    fn record(&self, finalization: Finalization) {
        let counter = match finalization {
            Finalization::Committed => &self.committed,
            Finalization::RolledBack(RollbackCause::Error) => &self.rolled_back_on_error,
            Finalization::RolledBack(RollbackCause::Panic) => &self.rolled_back_on_panic,
            Finalization::RolledBack(RollbackCause::Cancelled) => &self.rolled_back_on_cancel,
            Finalization::RolledBack(RollbackCause::CommitFailed) => &self.commit_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ManagerStats {
        ManagerStats {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back_on_error: self.rolled_back_on_error.load(Ordering::Relaxed),
            rolled_back_on_panic: self.rolled_back_on_panic.load(Ordering::Relaxed),
            rolled_back_on_cancel: self.rolled_back_on_cancel.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            rollback_failures: self.rollback_failures.load(Ordering::Relaxed),
        }
    }
}

/// What the unit of work did.
enum WorkOutcome<T, E> {
    Returned(Result<T, E>),
    Panicked(String),
}

fn run_contained<T, E, F>(work: F) -> WorkOutcome<T, E>
where
    F: FnOnce() -> Result<T, E>,
{
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(result) => WorkOutcome::Returned(result),
        Err(payload) => WorkOutcome::Panicked(panic_message(payload.as_ref())),
    }
}

/// What the worker may still decide once the work returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// The caller already returned this error; the transaction must roll back.
    Abandoned(ContextError),
    /// The caller is still waiting. A done parent only stops a commit.
    Live(Option<ContextError>),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Transaction manager for one backend instance.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
pub struct TxManager<B: Backend> {
    inner: Arc<TxManagerInner<B>>,
}

struct TxManagerInner<B: Backend> {
    backend: B,
    config: ManagerConfig,
    /// In-flight transactions tracked by ID.
    active: Mutex<HashMap<String, TransactionInfo>>,
    /// Signalled whenever `active` becomes empty.
    idle: Condvar,
    counters: Counters,
}

impl<B: Backend> Clone for TxManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> TxManager<B> {
    /// Create a transaction manager over `backend` with default settings.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, ManagerConfig::default())
    }

    pub fn with_config(backend: B, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(TxManagerInner {
                backend,
                config,
                active: Mutex::new(HashMap::new()),
                idle: Condvar::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Get a reference to the underlying backend.
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Key under which this manager's transactions are carried.
    pub fn key(&self) -> &ContextKey {
        self.inner.backend.key()
    }

    /// The ambient transaction this manager opened, if `ctx` carries one.
    pub fn current(&self, ctx: Option<&Context>) -> Option<TxHandle<B::Tx>> {
        self.inner.backend.lookup(ctx)
    }

    // ==================== Transactional Execution ====================

    /// Execute `work` within a new transaction, committing or rolling back.
    ///
    /// The transaction is always new, even if `parent` already carries one.
    /// `work` runs on the calling thread with a context that carries the
    /// transaction. Then exactly one of the following happens, in this order:
    /// - `work` panicked: rollback, [`TransactionError::Panicked`] is returned
    /// - `work` returned `Err(e)`: rollback, `e` is returned as is
    /// - `work` returned `Ok(_)` but `parent` is done by now: rollback, the
    ///   context error is returned
    /// - `work` returned `Ok(v)`: commit, then `Ok(v)` or the commit error
    ///
    /// Returns the context error without opening anything if `parent` is
    /// already done.
    pub fn with_transaction<T, E, F>(&self, parent: &Context, work: F) -> Result<T, E>
    where
        F: FnOnce(&Context) -> Result<T, E>,
        E: From<TransactionError>,
    {
        self.run(parent, |ctx, _| work(ctx))
    }

    /// Like [`Self::with_transaction`], but `work` runs on a worker thread
    /// while the caller watches `parent` for cancellation and its deadline.
    ///
    /// If the caller sees `parent` done before the outcome of `work` is
    /// recorded, it gets the context error right away and the worker rolls
    /// the transaction back as soon as `work` returns, whatever it returned.
    /// `work` is expected to notice the cancellation through its context and
    /// stop early.
    ///
    /// Otherwise the outcome is finalized as in [`Self::with_transaction`],
    /// and the caller waits for that result even if cancellation arrives
    /// during the commit. A panic raised by the engine while finalizing is
    /// returned as [`TransactionError::Panicked`].
    ///
    /// The transaction is never finalized while `work` may still be using it.
    pub fn with_transaction_cancellable<T, E, F>(&self, parent: &Context, work: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<TransactionError> + Send + 'static,
        F: FnOnce(Context) -> Result<T, E> + Send + 'static,
    {
        let (handle, ctx) = self.begin_scope(parent)?;
        let race: Arc<Race<T, E>> = Arc::new(Race::new());
        parent.subscribe(&race.signal);

        let worker = {
            let manager = self.clone();
            let parent = parent.clone();
            let handle = handle.clone();
            let race = Arc::clone(&race);
            move || {
                let outcome = run_contained(move || work(ctx));
                let claim = race.claim(&parent);
                race.finish(manager.finalize(&handle, outcome, claim));
            }
        };

        if let Err(e) = self.spawn_worker(worker) {
            // The worker never ran, so the transaction is still ours.
            self.rollback(&handle, RollbackCause::Error);
            self.untrack(handle.id());
            return Err(TransactionError::Spawn(e).into());
        }

        race.wait(parent)
    }

    /// Run `op` in the ambient transaction of `ctx`, or in a one-off
    /// transaction of its own if there is none.
    ///
    /// This is what data-access code calls, so that several calls made
    /// under one [`Self::with_transaction`] share its transaction while the
    /// same calls made on their own stay atomic individually.
    pub fn join_or_begin<T, E, F>(&self, ctx: Option<&Context>, op: F) -> Result<T, E>
    where
        F: FnOnce(&mut B::Tx) -> Result<T, E>,
        E: From<TransactionError>,
    {
        if let Some(reason) = ctx.and_then(Context::err) {
            return Err(TransactionError::from(reason).into());
        }

        match self.current(ctx) {
            Some(handle) => handle.with(op)?,
            None => {
                let background = Context::background();
                let parent = ctx.unwrap_or(&background);
                self.run(parent, |_, handle| handle.with(op)?)
            }
        }
    }

    fn run<T, E, F>(&self, parent: &Context, work: F) -> Result<T, E>
    where
        F: FnOnce(&Context, &TxHandle<B::Tx>) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let (handle, ctx) = self.begin_scope(parent)?;
        let outcome = run_contained(|| work(&ctx, &handle));
        self.finalize(&handle, outcome, Claim::Live(parent.err()))
    }

    fn spawn_worker<F>(&self, worker: F) -> std::io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut builder = thread::Builder::new().name(self.inner.config.worker_thread_name.clone());
        if let Some(size) = self.inner.config.worker_stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(worker).map(|_| ())
    }

    // ==================== Lifecycle ====================

    /// Begin a transaction and derive the context that carries it.
    fn begin_scope(&self, parent: &Context) -> TransactionResult<(TxHandle<B::Tx>, Context)> {
        if let Some(reason) = parent.err() {
            return Err(reason.into());
        }

        let backend = &self.inner.backend;
        let tx = backend.begin().map_err(|e| TransactionError::Begin {
            backend: backend.name(),
            source: Box::new(e),
        })?;

        let tx_id = Ulid::new().to_string().to_lowercase();
        let handle = TxHandle::new(tx_id.clone(), backend.name(), tx);
        self.inner.counters.begun.fetch_add(1, Ordering::Relaxed);
        self.track(&handle);
        debug!(tx_id = %tx_id, backend = backend.name(), "transaction begun");

        let ctx = backend.attach(parent, handle.clone());
        Ok((handle, ctx))
    }

    /// Finalize the transaction, containing any panic raised by the engine.
    ///
    /// The entry in `active` is removed on every path, so `drain` and the
    /// caller of the cancellable variant never wait on a dead worker.
    fn finalize<T, E>(&self, handle: &TxHandle<B::Tx>, outcome: WorkOutcome<T, E>, claim: Claim) -> Result<T, E>
    where
        E: From<TransactionError>,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| self.settle(handle, outcome, claim))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(tx_id = handle.id(), panic = %message, "transaction finalization panicked");
                if handle.close(TxState::RolledBack).is_none() {
                    handle.mark(TxState::RolledBack);
                }
                self.untrack(handle.id());
                Err(TransactionError::Panicked(message).into())
            }
        }
    }

    /// Finalize the transaction from the recorded outcome of the work.
    ///
    /// A panic wins over a returned error, which wins over a done parent.
    /// A done parent only turns a would-be commit into a rollback, unless the
    /// caller was already handed the cancellation.
    fn settle<T, E>(&self, handle: &TxHandle<B::Tx>, outcome: WorkOutcome<T, E>, claim: Claim) -> Result<T, E>
    where
        E: From<TransactionError>,
    {
        let result = match (claim, outcome) {
            (Claim::Abandoned(reason), outcome) => {
                if let WorkOutcome::Panicked(message) = &outcome {
                    error!(tx_id = handle.id(), panic = %message, "unit of work panicked after the caller returned");
                }
                self.rollback(handle, RollbackCause::Cancelled);
                Err(TransactionError::Context(reason).into())
            }
            (Claim::Live(_), WorkOutcome::Panicked(message)) => {
                error!(tx_id = handle.id(), panic = %message, "unit of work panicked");
                self.rollback(handle, RollbackCause::Panic);
                Err(TransactionError::Panicked(message).into())
            }
            (Claim::Live(_), WorkOutcome::Returned(Err(e))) => {
                self.rollback(handle, RollbackCause::Error);
                Err(e)
            }
            (Claim::Live(Some(reason)), WorkOutcome::Returned(Ok(_))) => {
                self.rollback(handle, RollbackCause::Cancelled);
                Err(TransactionError::Context(reason).into())
            }
            (Claim::Live(None), WorkOutcome::Returned(Ok(value))) => match self.commit(handle) {
                Ok(()) => Ok(value),
                Err(e) => Err(e.into()),
            },
        };

        self.untrack(handle.id());
        result
    }

    fn commit(&self, handle: &TxHandle<B::Tx>) -> TransactionResult<()> {
        let tx = handle.close(TxState::Committed).ok_or_else(|| TransactionError::NotActive {
            tx_id: handle.id().to_string(),
            state: handle.state(),
        })?;

        match self.inner.backend.commit(tx) {
            Ok(()) => {
                self.inner.counters.record(Finalization::Committed);
                debug!(tx_id = handle.id(), "transaction committed");
                Ok(())
            }
            Err(e) => {
                handle.mark(TxState::RolledBack);
                self.inner
                    .counters
                    .record(Finalization::RolledBack(RollbackCause::CommitFailed));
                error!(tx_id = handle.id(), error = %e, "commit failed");
                Err(TransactionError::Commit {
                    tx_id: handle.id().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Roll back and log; the cause has already decided what the caller sees.
    fn rollback(&self, handle: &TxHandle<B::Tx>, cause: RollbackCause) {
        let Some(tx) = handle.close(TxState::RolledBack) else {
            return;
        };

        self.inner.counters.record(Finalization::RolledBack(cause));
        match self.inner.backend.rollback(tx) {
            Ok(()) => {
                warn!(tx_id = handle.id(), cause = ?cause, "transaction rolled back");
            }
            Err(e) => {
                self.inner.counters.rollback_failures.fetch_add(1, Ordering::Relaxed);
                let err = TransactionError::Rollback {
                    tx_id: handle.id().to_string(),
                    source: Box::new(e),
                };
                error!(cause = ?cause, error = %err, "rollback failed");
            }
        }
    }

    // ==================== Tracking ====================

    fn track(&self, handle: &TxHandle<B::Tx>) {
        let info = TransactionInfo {
            tx_id: handle.id().to_string(),
            backend: handle.backend(),
            started_at: Utc::now(),
        };
        self.inner.active.lock().insert(info.tx_id.clone(), info);
    }

    fn untrack(&self, tx_id: &str) {
        let mut active = self.inner.active.lock();
        active.remove(tx_id);
        if active.is_empty() {
            self.inner.idle.notify_all();
        }
    }

    /// Get the number of in-flight transactions.
    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// List all in-flight transaction IDs.
    pub fn active_transactions(&self) -> Vec<String> {
        self.inner.active.lock().keys().cloned().collect()
    }

    /// Check if a transaction is still in flight.
    pub fn is_active(&self, tx_id: &str) -> bool {
        self.inner.active.lock().contains_key(tx_id)
    }

    /// Get metadata for an in-flight transaction.
    pub fn transaction_info(&self, tx_id: &str) -> Option<TransactionInfo> {
        self.inner.active.lock().get(tx_id).cloned()
    }

    /// Wait until no transaction of this manager is in flight.
    ///
    /// Returns `false` if some are still open after `timeout`. Useful after a
    /// cancelled [`Self::with_transaction_cancellable`], whose rollback
    /// happens after the call returned.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut active = self.inner.active.lock();
        while !active.is_empty() {
            if self.inner.idle.wait_until(&mut active, deadline).timed_out() {
                return active.is_empty();
            }
        }
        true
    }

    pub fn stats(&self) -> ManagerStats {
        self.inner.counters.snapshot()
    }
}

impl<B: Backend> fmt::Debug for TxManager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxManager")
            .field("backend", &self.inner.backend.name())
            .field("active_count", &self.active_count())
            .finish()
    }
}

// ==================== Cancellation Race ====================

enum RaceState<T, E> {
    /// The work is still running.
    Running,
    /// The caller returned on cancellation; the worker must roll back.
    Abandoned(ContextError),
    /// The worker recorded the outcome and is finalizing.
    Finalizing,
    /// Finalization finished; the caller has not picked it up yet.
    Done(Result<T, E>),
}

/// Single-use rendezvous between the caller and the worker.
///
/// Every decision goes through `state`, so exactly one side decides whether
/// cancellation wins.
struct Race<T, E> {
    state: Mutex<RaceState<T, E>>,
    signal: Arc<Signal>,
}

impl<T, E> Race<T, E>
where
    E: From<TransactionError>,
{
    fn new() -> Self {
        Self {
            state: Mutex::new(RaceState::Running),
            signal: Arc::new(Signal::new()),
        }
    }

    /// Worker side: the work returned. From here on the caller waits for
    /// finalization instead of racing it.
    fn claim(&self, parent: &Context) -> Claim {
        let mut state = self.state.lock();
        match &*state {
            RaceState::Abandoned(reason) => Claim::Abandoned(*reason),
            _ => {
                *state = RaceState::Finalizing;
                Claim::Live(parent.err())
            }
        }
    }

    /// Worker side: publish the finalization result.
    fn finish(&self, result: Result<T, E>) {
        let mut state = self.state.lock();
        if matches!(&*state, RaceState::Abandoned(_)) {
            return;
        }
        *state = RaceState::Done(result);
        drop(state);
        self.signal.notify();
    }

    /// Caller side: wait for the result or for `parent` to be done.
    fn wait(&self, parent: &Context) -> Result<T, E> {
        loop {
            let deadline = {
                let mut state = self.state.lock();
                match std::mem::replace(&mut *state, RaceState::Running) {
                    RaceState::Done(result) => return result,
                    RaceState::Running => {
                        if let Some(reason) = parent.err() {
                            *state = RaceState::Abandoned(reason);
                            warn!(reason = %reason, "context done before unit of work finished");
                            return Err(TransactionError::Context(reason).into());
                        }
                        parent.deadline()
                    }
                    // Finalization is no longer raced; only `finish` ends the wait.
                    other => {
                        *state = other;
                        None
                    }
                }
            };
            self.signal.wait_until(deadline);
        }
    }
}
