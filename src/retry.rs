use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Bounded retry schedule with exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 1 + 2 + 4 + 8 * 5 seconds outlasts the 30s init grace window.
        Self {
            max_attempts: 8,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Same delay before every attempt.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
        }
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms.max(self.base_delay_ms));
        Duration::from_millis(ms)
    }
}

/// Sleep through the schedule until `ready` reports true.
/// Returns false once every attempt is spent.
pub async fn wait_until<F>(policy: &RetryPolicy, op_name: &str, mut ready: F) -> bool
where
    F: FnMut() -> bool,
{
    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.delay_for(attempt)).await;
        if ready() {
            return true;
        }
        tracing::debug!(
            "{op_name}: not ready (attempt {attempt}/{})",
            policy.max_attempts
        );
    }
    false
}

/// Run `f`, retrying transient errors with backoff.
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                attempt += 1;
                tracing::warn!(
                    "{op_name}: transient error (attempt {attempt}/{}), retrying: {e}",
                    policy.max_attempts,
                );
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SettingsError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(8_000));
        assert_eq!(policy.delay_for(7), Duration::from_millis(8_000));
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(20, 100);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(19), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = retry_async(&RetryPolicy::fixed(3, 10), "flush", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SettingsError::HostNotReady)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_async_gives_up_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_async(&RetryPolicy::fixed(3, 10), "import", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SettingsError::NoBackup) }
        })
        .await;
        assert!(matches!(result, Err(SettingsError::NoBackup)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_exhausts() {
        let mut checks = 0;
        let ok = wait_until(&RetryPolicy::fixed(4, 5), "probe", || {
            checks += 1;
            false
        })
        .await;
        assert!(!ok);
        assert_eq!(checks, 4);
    }
}
