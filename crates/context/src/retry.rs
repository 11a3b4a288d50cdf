//! Bounded exponential-backoff retry.
//!
//! A policy is a fixed backoff schedule plus a classifier. The operation
//! runs once, then once more after each delay in the schedule while the
//! classifier says the failure is retryable. With `exponential(5, 500ms)`
//! that is up to six runs, waiting 0.5s, 1s, 2s, 4s and 8s in between.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail,
}

/// Decides whether a failure is worth another attempt.
pub trait RetryClassifier: Send + Sync {
    fn classify(&self, err: &(dyn StdError + 'static)) -> RetryDecision;
}

/// Retries every error.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAll;

impl RetryClassifier for RetryAll {
    fn classify(&self, _err: &(dyn StdError + 'static)) -> RetryDecision {
        RetryDecision::Retry
    }
}

impl<F> RetryClassifier for F
where
    F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync,
{
    fn classify(&self, err: &(dyn StdError + 'static)) -> RetryDecision {
        if self(err) {
            RetryDecision::Retry
        } else {
            RetryDecision::Fail
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
    classifier: Arc<dyn RetryClassifier>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::exponential(5, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    /// `retries` delays starting at `base`, doubling each time.
    pub fn exponential(retries: u32, base: Duration) -> Self {
        let backoff = (0..retries)
            .map(|i| base.saturating_mul(1u32.checked_shl(i).unwrap_or(u32::MAX)))
            .collect();
        RetryPolicy {
            backoff,
            classifier: Arc::new(RetryAll),
        }
    }

    /// Run once, never retry.
    pub fn none() -> Self {
        RetryPolicy {
            backoff: Vec::new(),
            classifier: Arc::new(RetryAll),
        }
    }

    pub fn with_classifier<C>(mut self, classifier: C) -> Self
    where
        C: RetryClassifier + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn backoff(&self) -> &[Duration] {
        &self.backoff
    }

    /// Upper bound on how many times `run` invokes the operation.
    pub fn max_attempts(&self) -> usize {
        self.backoff.len() + 1
    }

    /// Run `op` until it succeeds, the classifier rejects the error, or the
    /// schedule is exhausted. The last error is returned on failure.
    ///
    /// `op` receives the zero-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let delay = match self.backoff.get(attempt) {
                Some(delay) => *delay,
                None => return Err(err),
            };
            if self.classifier.classify(&err) == RetryDecision::Fail {
                return Err(err);
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct Flaky(&'static str);

    #[test]
    fn exponential_schedule_doubles() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(500));
        let millis: Vec<u128> = policy.backoff().iter().map(|d| d.as_millis()).collect();
        assert_eq!(millis, vec![500, 1000, 2000, 4000, 8000]);
        assert_eq!(policy.max_attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::exponential(3, Duration::from_millis(10));
        let result: Result<&str, Flaky> = policy
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(Flaky("not yet"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::exponential(2, Duration::from_millis(10));
        let result: Result<(), Flaky> = policy
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(if attempt == 2 { Flaky("last") } else { Flaky("early") }) }
            })
            .await;
        assert_eq!(result.unwrap_err().0, "last");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_can_stop_retries() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::exponential(5, Duration::from_millis(10))
            .with_classifier(|err: &(dyn StdError + 'static)| err.to_string() != "fatal");
        let result: Result<(), Flaky> = policy
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky("fatal")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn none_runs_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), Flaky> = RetryPolicy::none()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky("nope")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
