use std::error::Error as StdError;
use std::fmt;

use crate::context::TxState;
use crate::event::DispatchError;

/// Why a context stopped before reaching a terminal transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called.
    Cancelled,
    /// The deadline timer fired.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "context manually canceled"),
            CancelReason::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

/// Failure reported by a compensating or commit action.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ActionError(Box<dyn StdError + Send + Sync>);

impl ActionError {
    /// Wrap any error (or a plain message) as an action failure.
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self(err.into())
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.0
    }
}

/// Errors returned by [`TransactionContext`](crate::TransactionContext) operations.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Commit, rollback or registration attempted after the context
    /// already committed or rolled back.
    #[error("tried to use transaction that has already been {state}")]
    AlreadyFinalized { state: TxState },

    #[error("context manually canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// A memoized resource exists under `key` but with a different type.
    #[error("transaction object '{key}' has a different type than requested")]
    ResourceType { key: String },

    /// A commit action failed; later commit actions did not run.
    #[error("commit action failed: {0}")]
    CommitAction(#[source] ActionError),

    /// Queued events could not be handed to the dispatcher.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl From<CancelReason> for ContextError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Cancelled => ContextError::Cancelled,
            CancelReason::DeadlineExceeded => ContextError::DeadlineExceeded,
        }
    }
}
