//! Domain events queued by a unit of work and the dispatch boundary they
//! cross on commit.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::minimal::MinimalContext;
use crate::retry::RetryPolicy;

/// An event recorded during a unit of work, delivered on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchableEvent {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saga_id: Option<String>,
    pub stream: String,
    pub stream_id: String,
    pub event_type: String,
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub event_time: OffsetDateTime,
    pub payload: serde_json::Value,
}

impl DispatchableEvent {
    /// Event stamped with the current time, id 0 and no saga.
    pub fn new(
        stream: &str,
        stream_id: &str,
        event_type: &str,
        version: u64,
        payload: serde_json::Value,
    ) -> Self {
        DispatchableEvent {
            id: 0,
            saga_id: None,
            stream: stream.to_string(),
            stream_id: stream_id.to_string(),
            event_type: event_type.to_string(),
            version,
            event_time: OffsetDateTime::now_utc(),
            payload,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_saga_id(mut self, saga_id: &str) -> Self {
        self.saga_id = Some(saga_id.to_string());
        self
    }

    pub fn with_event_time(mut self, event_time: OffsetDateTime) -> Self {
        self.event_time = event_time;
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("event dispatch failed: {0}")]
    Failed(String),

    #[error("event dispatch failed after {attempts} attempts, {dead_lettered} events dead-lettered: {last}")]
    Exhausted {
        attempts: usize,
        dead_lettered: usize,
        last: String,
    },
}

/// The notification pipeline that receives a unit of work's events on commit.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn publish_batch(
        &self,
        ctx: &MinimalContext,
        events: &[DispatchableEvent],
    ) -> Result<(), DispatchError>;
}

/// Accepts and drops every batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDispatcher;

#[async_trait]
impl EventDispatcher for NoopDispatcher {
    async fn publish_batch(
        &self,
        _ctx: &MinimalContext,
        events: &[DispatchableEvent],
    ) -> Result<(), DispatchError> {
        tracing::trace!(count = events.len(), "dropping event batch");
        Ok(())
    }
}

/// Retries another dispatcher and parks batches it cannot deliver.
///
/// Failed batches land in an in-memory dead-letter queue; the commit that
/// produced them still fails with [`DispatchError::Exhausted`].
pub struct RetryingDispatcher<D> {
    inner: D,
    policy: RetryPolicy,
    dead_letters: Mutex<Vec<DispatchableEvent>>,
}

impl<D: EventDispatcher> RetryingDispatcher<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        RetryingDispatcher {
            inner,
            policy,
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    /// Take every dead-lettered event, oldest first.
    pub fn drain_dead_letters(&self) -> Vec<DispatchableEvent> {
        std::mem::take(&mut *self.dead_letters.lock())
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().len()
    }
}

#[async_trait]
impl<D: EventDispatcher> EventDispatcher for RetryingDispatcher<D> {
    async fn publish_batch(
        &self,
        ctx: &MinimalContext,
        events: &[DispatchableEvent],
    ) -> Result<(), DispatchError> {
        let result = self
            .policy
            .run(|attempt| async move {
                let outcome = self.inner.publish_batch(ctx, events).await;
                if let Err(err) = &outcome {
                    tracing::warn!(attempt, error = %err, "failed to publish event batch");
                }
                outcome
            })
            .await;

        result.map_err(|last| {
            self.dead_letters.lock().extend_from_slice(events);
            tracing::error!(
                count = events.len(),
                error = %last,
                "event batch dead-lettered, max retries exceeded"
            );
            DispatchError::Exhausted {
                attempts: self.policy.max_attempts(),
                dead_lettered: events.len(),
                last: last.to_string(),
            }
        })
    }
}
