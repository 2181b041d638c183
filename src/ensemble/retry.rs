//! Retry Policy
//!
//! Fixed-interval retry of transient ensemble errors. The default policy
//! never gives up: a coordination node without connectivity has nothing
//! useful to do but wait. Every sleep is raced against a cancellation
//! token so shutdown never waits out a retry interval.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Fixed-interval retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay between attempts
    interval: Duration,
    /// Total attempts allowed (`None` = unbounded)
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry forever with a fixed interval
    pub fn forever(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Give up after `attempts` attempts
    pub fn bounded(attempts: u32, interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: Some(attempts.max(1)),
        }
    }

    /// Delay between attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }

    /// Run `op`, retrying transient errors
    pub async fn run<T, F, Fut>(&self, name: &str, cancel: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(name, cancel, Error::is_retryable, op).await
    }

    /// Run `op`, retrying every error accepted by `should_retry`
    pub async fn run_if<T, F, Fut, P>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        should_retry: P,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            attempts += 1;
            if matches!(err, Error::Cancelled) || !should_retry(&err) || !self.allows(attempts) {
                return Err(err);
            }

            if attempts == 1 || attempts % 10 == 0 {
                tracing::warn!(
                    "{} failed (attempt {}): {}, retrying every {:?}",
                    name,
                    attempts,
                    err,
                    self.interval
                );
            } else {
                tracing::debug!("{} failed (attempt {}): {}", name, attempts, err);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::forever(Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_errors_until_success() {
        let policy = RetryPolicy::forever(Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = policy
            .run("flaky", &cancel, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(Error::ConnectionLoss("blip".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let policy = RetryPolicy::forever(Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run("create", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::NodeExists("/fleet".into()))
            })
            .await;

        assert!(matches!(result, Err(Error::NodeExists(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_policy_gives_up() {
        let policy = RetryPolicy::bounded(3, Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run("down", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("unreachable".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_preempts_sleep() {
        let policy = RetryPolicy::forever(Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<()> = policy
            .run("never", &cancel, || async { Err(Error::ConnectionLoss("down".into())) })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
