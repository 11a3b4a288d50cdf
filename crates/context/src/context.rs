//! The transaction context (unit of work).
//!
//! ## Locking
//!
//! Two locks, never held together in the wrong order:
//!
//! - `tx` (async) guards the registries and the resource table. The
//!   terminal-state transition happens under it, so a registration either
//!   lands before commit/rollback drains the registries or is rejected.
//! - `cancel_reason` (sync) guards the cancellation transition only and is
//!   never held across an await.
//!
//! Commit and rollback drain their registries under `tx` and run the
//! actions after releasing it.
//!
//! ## Interruption
//!
//! Rollback trips an internal abort token before it takes `tx`. In-flight
//! store and cache calls race [`Cancellable::interrupted`], so a call that
//! holds `tx` (a resource constructor) or a resource lock a compensation
//! needs is dropped before rollback waits on it. `err()` and `done()` only
//! change after rollback has finished.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::Instrument;

use crate::action::Action;
use crate::error::{CancelReason, ContextError};
use crate::event::{DispatchableEvent, EventDispatcher};
use crate::minimal::MinimalContext;
use crate::retry::RetryPolicy;
use crate::trace::{Correlated, TraceInfo};

/// Cancellation capability shared by every context kind.
///
/// Store and cache calls race [`Cancellable::cancellation_token`] so a
/// cancelled or expired context bounds how long they can run.
pub trait Cancellable: Correlated + Send + Sync {
    fn cancellation_token(&self) -> &CancellationToken;

    /// Why the context was cancelled, if it was.
    fn err(&self) -> Option<CancelReason>;

    /// Resolves once the context is cancelled or expires.
    fn done(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation_token().cancelled()
    }

    /// Resolves once work started on behalf of this context should stop.
    /// Never later than [`done`](Self::done).
    fn interrupted(&self) -> WaitForCancellationFuture<'_> {
        self.done()
    }

    /// Why in-flight work was interrupted; `Some` once
    /// [`interrupted`](Self::interrupted) has resolved.
    fn interruption(&self) -> Option<ContextError> {
        self.err().map(ContextError::from)
    }
}

/// Lifecycle of a unit of work. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Pending,
    Committed,
    RolledBack,
}

impl TxState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TxState::Committed,
            2 => TxState::RolledBack,
            _ => TxState::Pending,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TxState::Pending => 0,
            TxState::Committed => 1,
            TxState::RolledBack => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != TxState::Pending
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxState::Pending => write!(f, "pending"),
            TxState::Committed => write!(f, "committed"),
            TxState::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// A memoized transactional resource.
#[derive(Debug)]
pub struct TxObject<T> {
    pub value: Arc<T>,
    /// `true` only for the call that constructed `value`.
    pub created: bool,
}

#[derive(Default)]
struct TxRegistry {
    compensatory_actions: Vec<Box<dyn Action>>,
    commit_actions: Vec<Box<dyn Action>>,
    final_commit_actions: Vec<Box<dyn Action>>,
    events: Vec<DispatchableEvent>,
    objects: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl TxRegistry {
    fn clear(&mut self) {
        *self = TxRegistry::default();
    }
}

struct Inner {
    trace: TraceInfo,
    deadline: Instant,
    retry: RetryPolicy,
    dispatcher: Arc<dyn EventDispatcher>,

    state: AtomicU8,
    tx: tokio::sync::Mutex<TxRegistry>,

    token: CancellationToken,
    /// Child of `token`, tripped early by rollback.
    abort: CancellationToken,
    cancel_reason: Mutex<Option<CancelReason>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

/// One logical operation's unit of work. Cloning shares the same context.
///
/// Created by [`ContextFactory`](crate::ContextFactory).
#[derive(Clone)]
pub struct TransactionContext {
    inner: Arc<Inner>,
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("trace", &self.inner.trace)
            .field("state", &self.state())
            .field("err", &self.err())
            .finish_non_exhaustive()
    }
}

impl TransactionContext {
    pub(crate) fn new(
        trace: TraceInfo,
        deadline: Instant,
        retry: RetryPolicy,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> Self {
        let token = CancellationToken::new();
        TransactionContext {
            inner: Arc::new(Inner {
                trace,
                deadline,
                retry,
                dispatcher,
                state: AtomicU8::new(TxState::Pending.as_u8()),
                tx: tokio::sync::Mutex::new(TxRegistry::default()),
                abort: token.child_token(),
                token,
                cancel_reason: Mutex::new(None),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Spawn the deadline timer. Requires a Tokio runtime.
    pub(crate) fn arm_deadline(&self) {
        let ctx = self.clone();
        let deadline = self.inner.deadline;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // Detach before rolling back so a concurrent explicit
            // commit/rollback cannot abort this task mid-pipeline.
            ctx.inner.timer.lock().take();
            ctx.cancel_with(CancelReason::DeadlineExceeded, false).await;
        });
        *self.inner.timer.lock() = Some(handle);
    }

    fn disarm_deadline(&self) {
        if let Some(handle) = self.inner.timer.lock().take() {
            handle.abort();
        }
    }

    pub fn state(&self) -> TxState {
        TxState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }

    /// Snapshot of this context's correlation identifiers.
    pub fn minimal(&self) -> MinimalContext {
        MinimalContext::new(self.inner.trace.clone())
    }

    fn ensure_pending(&self) -> Result<(), ContextError> {
        match self.state() {
            TxState::Pending => Ok(()),
            state => Err(ContextError::AlreadyFinalized { state }),
        }
    }

    /// Single check-and-set out of `Pending`. Exactly one caller wins.
    fn finalize(&self, to: TxState) -> Result<(), ContextError> {
        self.inner
            .state
            .compare_exchange(
                TxState::Pending.as_u8(),
                to.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|current| ContextError::AlreadyFinalized {
                state: TxState::from_u8(current),
            })
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    /// Roll back and mark the context cancelled. Only the first call has
    /// any effect on `err()`/`done()`.
    pub async fn cancel(&self) {
        self.cancel_with(CancelReason::Cancelled, true).await;
    }

    async fn cancel_with(&self, reason: CancelReason, disarm: bool) {
        let first = {
            let mut slot = self.inner.cancel_reason.lock();
            if slot.is_some() {
                false
            } else {
                *slot = Some(reason);
                true
            }
        };
        self.rollback(disarm).await;
        if first {
            self.inner.token.cancel();
            tracing::debug!(trace_id = %self.inner.trace.trace_id, %reason, "context cancelled");
        }
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Queue an action to run if the unit of work rolls back.
    pub async fn register_compensatory_action<A>(&self, action: A) -> Result<(), ContextError>
    where
        A: Action + 'static,
    {
        let mut tx = self.inner.tx.lock().await;
        self.ensure_pending()?;
        tx.compensatory_actions.push(Box::new(action));
        Ok(())
    }

    /// Queue an action to run, in registration order, on commit.
    pub async fn register_commit_action<A>(&self, action: A) -> Result<(), ContextError>
    where
        A: Action + 'static,
    {
        let mut tx = self.inner.tx.lock().await;
        self.ensure_pending()?;
        tx.commit_actions.push(Box::new(action));
        Ok(())
    }

    /// Queue an action that runs on commit after every ordinary commit
    /// action. Store-transaction commits belong here, so a failing ordinary
    /// action leaves the store transaction uncommitted.
    pub async fn register_final_commit_action<A>(&self, action: A) -> Result<(), ContextError>
    where
        A: Action + 'static,
    {
        let mut tx = self.inner.tx.lock().await;
        self.ensure_pending()?;
        tx.final_commit_actions.push(Box::new(action));
        Ok(())
    }

    pub async fn register_event(&self, event: DispatchableEvent) -> Result<(), ContextError> {
        let mut tx = self.inner.tx.lock().await;
        self.ensure_pending()?;
        tx.events.push(event);
        Ok(())
    }

    /// Fetch the resource memoized under `key`, constructing it on first use.
    ///
    /// The constructor runs under the transaction lock, at most once per
    /// successful construction; if it fails nothing is cached and the next
    /// call tries again. The constructor must not call back into this context
    /// except through [`Cancellable`], and a constructor that awaits I/O must
    /// race [`Cancellable::interrupted`] or rollback cannot proceed.
    pub async fn get_transaction_object<T, E, F, Fut>(
        &self,
        key: &str,
        constructor: F,
    ) -> Result<TxObject<T>, E>
    where
        T: Any + Send + Sync,
        E: From<ContextError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut tx = self.inner.tx.lock().await;
        self.ensure_pending()?;

        if let Some(existing) = tx.objects.get(key) {
            let value = Arc::clone(existing)
                .downcast::<T>()
                .map_err(|_| ContextError::ResourceType {
                    key: key.to_string(),
                })?;
            return Ok(TxObject {
                value,
                created: false,
            });
        }

        let value = Arc::new(constructor().await?);
        tx.objects
            .insert(key.to_string(), value.clone() as Arc<dyn Any + Send + Sync>);
        Ok(TxObject {
            value,
            created: true,
        })
    }

    // ── Terminal transitions ──────────────────────────────────────────────────

    /// Commit the unit of work.
    ///
    /// Queued events go to the dispatcher first, then commit actions run in
    /// registration order, then final commit actions. The first failure
    /// stops the pipeline and is returned; actions that already ran are not
    /// reverted and the context stays committed.
    pub async fn commit_transaction(&self) -> Result<(), ContextError> {
        let drained = {
            let mut tx = self.inner.tx.lock().await;
            self.finalize(TxState::Committed)?;
            let drained = (
                std::mem::take(&mut tx.events),
                std::mem::take(&mut tx.commit_actions),
                std::mem::take(&mut tx.final_commit_actions),
            );
            tx.clear();
            drained
        };
        self.disarm_deadline();

        let (events, commit_actions, final_commit_actions) = drained;
        let ctx = self.minimal();
        let dispatcher = Arc::clone(&self.inner.dispatcher);

        async move {
            if !events.is_empty() {
                dispatcher.publish_batch(&ctx, &events).await?;
            }
            for action in commit_actions.iter().chain(final_commit_actions.iter()) {
                if let Err(err) = action.run(&ctx).await {
                    tracing::warn!(error = %err, "commit action failed");
                    return Err(ContextError::CommitAction(err));
                }
            }
            Ok(())
        }
        .instrument(self.span())
        .await
    }

    /// Roll back the unit of work. No-op if already committed or rolled back.
    ///
    /// Every compensating action runs, each under the retry policy. A
    /// compensation that still fails is logged and the rest still run.
    pub async fn rollback_transaction(&self) {
        self.rollback(true).await;
    }

    async fn rollback(&self, disarm: bool) {
        if self.state() == TxState::Committed {
            return;
        }
        self.inner.abort.cancel();

        let compensations = {
            let mut tx = self.inner.tx.lock().await;
            if self.finalize(TxState::RolledBack).is_err() {
                return;
            }
            let compensations = std::mem::take(&mut tx.compensatory_actions);
            tx.clear();
            compensations
        };
        if disarm {
            self.disarm_deadline();
        }

        let ctx = self.minimal();
        let retry = self.inner.retry.clone();
        async move {
            for compensation in &compensations {
                let result = retry
                    .run(|attempt| {
                        let ctx = &ctx;
                        async move {
                            let outcome = compensation.run(ctx).await;
                            if let Err(err) = &outcome {
                                tracing::warn!(
                                    attempt,
                                    error = %err,
                                    "failed to run compensatory action"
                                );
                            }
                            outcome
                        }
                    })
                    .await;
                if let Err(err) = result {
                    tracing::error!(
                        error = %err,
                        "failed to run compensatory action, max retries exceeded"
                    );
                }
            }
        }
        .instrument(self.span())
        .await
    }
}

impl Correlated for TransactionContext {
    fn trace_info(&self) -> &TraceInfo {
        &self.inner.trace
    }
}

impl Cancellable for TransactionContext {
    fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.token
    }

    fn err(&self) -> Option<CancelReason> {
        // The reason is recorded before rollback starts; it is only
        // reported once rollback is done.
        if !self.inner.token.is_cancelled() {
            return None;
        }
        *self.inner.cancel_reason.lock()
    }

    fn interrupted(&self) -> WaitForCancellationFuture<'_> {
        self.inner.abort.cancelled()
    }

    fn interruption(&self) -> Option<ContextError> {
        if !self.inner.abort.is_cancelled() {
            return None;
        }
        Some(match *self.inner.cancel_reason.lock() {
            Some(reason) => reason.into(),
            None => ContextError::AlreadyFinalized {
                state: TxState::RolledBack,
            },
        })
    }
}
