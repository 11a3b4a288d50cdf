//! Transactional unit of work.
//!
//! A [`TransactionContext`] wraps one logical operation: repositories pull
//! shared resources (such as a store transaction) out of it, register
//! compensating actions, commit actions and domain events as side effects
//! accrue, and the caller finishes with exactly one of
//! [`TransactionContext::commit_transaction`] or
//! [`TransactionContext::rollback_transaction`]. A deadline timer rolls the
//! unit of work back if neither happens in time.
//!
//! Actions run with a [`MinimalContext`] carrying only correlation data, so
//! they still work after the parent context has been cancelled.

mod action;
mod context;
mod error;
mod event;
mod factory;
mod minimal;
mod retry;
mod settings;
mod trace;

pub use action::Action;
pub use context::{Cancellable, TransactionContext, TxObject, TxState};
pub use error::{ActionError, CancelReason, ContextError};
pub use event::{
    DispatchError, DispatchableEvent, EventDispatcher, NoopDispatcher, RetryingDispatcher,
};
pub use factory::ContextFactory;
pub use minimal::MinimalContext;
pub use retry::{RetryAll, RetryClassifier, RetryDecision, RetryPolicy};
pub use settings::{ContextSettings, RetrySettings, SettingsError};
pub use trace::{Correlated, TraceInfo, TraceParseError};
