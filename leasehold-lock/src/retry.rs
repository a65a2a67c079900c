//! Backoff and retry for transient store errors

use crate::config::LockConfig;
use leasehold_store::StoreResult;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Create a backoff from the lock configuration.
    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.initial_backoff, config.max_backoff)
    }

    /// Next delay. Doubles each call up to the cap, plus up to 50% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);

        let jitter_ms = u64::try_from(base.as_millis() / 2).unwrap_or(0);
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        (base + jitter).min(self.max)
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Run `operation`, retrying transient errors up to `config.max_attempts` times.
pub(crate) async fn with_retry<T, F, Fut>(
    name: &'static str,
    config: &LockConfig,
    mut operation: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut backoff = Backoff::from_config(config);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = backoff.next_delay();
                warn!(
                    operation = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_store::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(300));

        for _ in 0..5 {
            assert!(backoff.next_delay() <= Duration::from_millis(400));
        }

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_from_transient_errors() {
        let config = LockConfig::default();
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let result = with_retry("test", &config, || async move {
            let calls = calls_ref;
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unavailable("leader election".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up_after_max_attempts() {
        let config = LockConfig::builder().max_attempts(3).build();
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let result: StoreResult<()> = with_retry("test", &config, || async move {
            let calls = calls_ref;
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Timeout)
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_does_not_retry_permanent_errors() {
        let config = LockConfig::default();
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let result: StoreResult<()> = with_retry("test", &config, || async move {
            let calls = calls_ref;
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Compacted(4))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
