//! Bounded exponential backoff for polling and transient remote failures.

use std::future::Future;
use std::time::Duration;

/// Doubling delay with a ceiling. Attempt 0 waits `base`, attempt 1 waits
/// `2 * base`, and so on, never exceeding `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
        }
    }
}

/// Run `operation` up to `max_attempts` times, sleeping with backoff between
/// failures. Returns the first success or the last error.
pub async fn retry_with_backoff<F, Fut, T, E>(
    backoff: &Backoff,
    max_attempts: u32,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(backoff.delay_for(attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(0), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(16));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(30), Duration::from_secs(30));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(120));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn returns_first_success() {
        let backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = retry_with_backoff(&backoff, 5, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(&backoff, 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {n}")) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "attempt 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
