use crate::prelude::*;

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Run `f`, retrying transient errors with doubling, jittered backoff.
/// Non-transient errors and exhaustion return the last error unchanged.
pub async fn run<T, F, Fut>(mut f: F, options: &RetryOptions) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = options.initial_backoff;
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < options.max_retries => {
                attempt += 1;
                let jitter: f64 = rand::rng().random_range(0.8..1.2);
                let delay = backoff.mul_f64(jitter);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient graph error, backing off"
                );
                tokio::time::sleep(delay).await;
                backoff = (backoff * 2).min(options.max_backoff);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

    fn quick_options(max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = run(
            || async {
                if attempts.fetch_add(1, Relaxed) < 2 {
                    Err(Error::TransientGraph(anyhow::anyhow!("flaky")))
                } else {
                    Ok(42)
                }
            },
            &quick_options(5),
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(attempts.load(Relaxed), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let err = run(
            || async {
                attempts.fetch_add(1, Relaxed);
                Err::<(), _>(Error::TransientGraph(anyhow::anyhow!("down")))
            },
            &quick_options(2),
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(attempts.load(Relaxed), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let err = run(
            || async {
                attempts.fetch_add(1, Relaxed);
                Err::<(), _>(Error::Graph(anyhow::anyhow!("constraint")))
            },
            &quick_options(5),
        )
        .await
        .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(attempts.load(Relaxed), 1);
    }

    #[tokio::test]
    async fn zero_retries_fails_on_first_transient_error() {
        let attempts = AtomicU32::new(0);
        let _ = run(
            || async {
                attempts.fetch_add(1, Relaxed);
                Err::<(), _>(Error::TransientGraph(anyhow::anyhow!("down")))
            },
            &quick_options(0),
        )
        .await
        .unwrap_err();
        assert_eq!(attempts.load(Relaxed), 1);
    }
}
