use tokio_util::sync::CancellationToken;

use crate::context::Cancellable;
use crate::error::CancelReason;
use crate::trace::{Correlated, TraceInfo};

/// Correlation-only context handed to commit and compensating actions.
///
/// It has no transaction state, no deadline and is never cancelled, so an
/// action keeps running even when the context that scheduled it has expired.
#[derive(Debug, Clone)]
pub struct MinimalContext {
    trace: TraceInfo,
    token: CancellationToken,
}

impl MinimalContext {
    pub fn new(trace: TraceInfo) -> Self {
        MinimalContext {
            trace,
            token: CancellationToken::new(),
        }
    }
}

impl Correlated for MinimalContext {
    fn trace_info(&self) -> &TraceInfo {
        &self.trace
    }
}

impl Cancellable for MinimalContext {
    fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    fn err(&self) -> Option<CancelReason> {
        None
    }
}
