use std::future::Future;

use async_trait::async_trait;

use crate::error::ActionError;
use crate::minimal::MinimalContext;

/// A deferred unit of work run during commit or rollback.
///
/// Compensating actions may run more than once (each run is wrapped in the
/// context's retry policy), so they must tolerate repetition.
///
/// Any `Fn(MinimalContext) -> impl Future<Output = Result<(), ActionError>>`
/// closure is an `Action`:
///
/// ```ignore
/// ctx.register_commit_action(move |_ctx: MinimalContext| async move {
///     publish(&payload).await.map_err(ActionError::new)
/// })
/// .await?;
/// ```
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, ctx: &MinimalContext) -> Result<(), ActionError>;
}

#[async_trait]
impl<F, Fut> Action for F
where
    F: Fn(MinimalContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ActionError>> + Send,
{
    async fn run(&self, ctx: &MinimalContext) -> Result<(), ActionError> {
        (self)(ctx.clone()).await
    }
}
