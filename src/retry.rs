//! Bounded retry with exponential backoff.
//!
//! Used at the consumer layer: store hiccups are retried here, never silently
//! swallowed and never allowed to spin a hot loop. Every backoff is a
//! `retry.backoff` record in the run log, so a flapping store shows up in the
//! audit trail before it exhausts.

use anyhow::{Context, Result};
use rand::Rng;
use std::future::Future;
use tokio::time::{sleep, Duration};

use crate::logging::{json_log, obj, v_num, v_str};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with full jitter: anywhere between half and all of
    /// the clamped delay, so concurrent retriers spread out.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.min(20));
        let clamped = exp.min(self.max_delay_ms).max(1);
        let ms = rand::thread_rng().gen_range(clamped / 2..=clamped);
        Duration::from_millis(ms)
    }
}

/// Retry a fallible async operation with exponential backoff. The final
/// error carries the operation name and attempt count.
pub async fn retry_async<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                json_log(
                    "retry.backoff",
                    obj(&[
                        ("operation", v_str(operation)),
                        ("attempt", v_num((attempt + 1) as f64)),
                        ("delay_ms", v_num(delay.as_millis() as f64)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("{} failed after {} attempts", operation, attempt + 1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let cfg = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let attempts = AtomicU32::new(0);
        let result = retry_async(&cfg, "flaky", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow!("transient"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_with_attempt_count() {
        let cfg = RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_async(&cfg, "hopeless", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("permanent")) }
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("hopeless failed after 3 attempts"), "{}", msg);
    }

    #[tokio::test]
    async fn test_delay_bounded_by_max() {
        let cfg = RetryConfig {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 250,
        };
        for attempt in 0..10 {
            let d = cfg.delay_for_attempt(attempt);
            assert!(d <= Duration::from_millis(250), "{:?}", d);
        }
    }
}
