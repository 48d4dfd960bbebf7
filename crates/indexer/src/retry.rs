use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::IndexerError;

/// Bounded retry with exponential backoff.
///
/// The default retries three times after the first attempt, waiting
/// 2s, 4s and 8s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, initial_backoff: Duration::from_secs(2), multiplier: 2 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, multiplier: u32) -> Self {
        Self { max_retries, initial_backoff, multiplier: multiplier.max(1) }
    }

    /// Delay before the given retry (1-based), `None` once retries are used up.
    pub fn backoff(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let factor = self.multiplier.checked_pow(retry - 1).unwrap_or(u32::MAX);
        Some(self.initial_backoff.saturating_mul(factor))
    }

    /// The whole backoff schedule.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_retries).filter_map(|retry| self.backoff(retry))
    }

    /// Runs `op` until it succeeds, fails with a non-upstream error, or the
    /// schedule is exhausted, in which case the last error is returned.
    ///
    /// Cancellation interrupts the backoff sleep with [`IndexerError::Shutdown`].
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, IndexerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, IndexerError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_upstream() => return Err(err),
                Err(err) => err,
            };
            attempt += 1;
            let Some(delay) = self.backoff(attempt) else {
                return Err(err);
            };
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(IndexerError::Shutdown),
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn transport() -> IndexerError {
        IndexerError::Transport { endpoint: "a".to_string(), message: "reset".to_string() }
    }

    #[test]
    fn default_schedule() {
        let delays = RetryPolicy::default().delays().collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)]
        );
        assert_eq!(RetryPolicy::default().backoff(4), None);
        assert_eq!(RetryPolicy::new(0, Duration::ZERO, 1).delays().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = RetryPolicy::default()
            .run(&CancellationToken::new(), move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 { Err(transport()) } else { Ok(42) }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_with_last_error() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run(&CancellationToken::new(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transport())
            })
            .await;
        assert!(matches!(result, Err(IndexerError::Transport { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_upstream_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run(&CancellationToken::new(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(IndexerError::InvalidArgument("bad range".to_string()))
            })
            .await;
        assert!(matches!(result, Err(IndexerError::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            RetryPolicy::default().run(&cancel, |_| async { Err(transport()) }).await;
        assert!(matches!(result, Err(IndexerError::Shutdown)));
    }
}
