use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::context::TransactionContext;
use crate::event::{EventDispatcher, NoopDispatcher};
use crate::retry::RetryPolicy;
use crate::settings::ContextSettings;
use crate::trace::Correlated;

/// Creates [`TransactionContext`]s that share a retry policy and an event
/// dispatcher.
#[derive(Clone)]
pub struct ContextFactory {
    default_timeout: Duration,
    retry: RetryPolicy,
    dispatcher: Arc<dyn EventDispatcher>,
}

impl std::fmt::Debug for ContextFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextFactory")
            .field("default_timeout", &self.default_timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Default for ContextFactory {
    fn default() -> Self {
        ContextFactory::from_settings(&ContextSettings::default())
    }
}

impl ContextFactory {
    pub fn new(
        default_timeout: Duration,
        retry: RetryPolicy,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> Self {
        ContextFactory {
            default_timeout,
            retry,
            dispatcher,
        }
    }

    /// Factory with the configured timeout and retry schedule and a
    /// [`NoopDispatcher`].
    pub fn from_settings(settings: &ContextSettings) -> Self {
        ContextFactory::new(
            settings.timeout(),
            settings.retry.policy(),
            Arc::new(NoopDispatcher),
        )
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn EventDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Start a unit of work that inherits `parent`'s correlation identifiers
    /// and rolls itself back after `timeout` unless committed or rolled back
    /// first.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, since the deadline timer
    /// is a spawned task.
    pub fn create<P>(&self, parent: &P, timeout: Duration) -> TransactionContext
    where
        P: Correlated + ?Sized,
    {
        let ctx = TransactionContext::new(
            parent.trace_info().clone(),
            Instant::now() + timeout,
            self.retry.clone(),
            Arc::clone(&self.dispatcher),
        );
        ctx.arm_deadline();
        tracing::trace!(
            trace_id = %parent.trace_info().trace_id,
            timeout_ms = timeout.as_millis() as u64,
            "created transaction context"
        );
        ctx
    }

    /// [`create`](Self::create) with the factory's default timeout.
    pub fn create_default<P>(&self, parent: &P) -> TransactionContext
    where
        P: Correlated + ?Sized,
    {
        self.create(parent, self.default_timeout)
    }
}
