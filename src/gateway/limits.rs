// =============================================================================
// REST limits — shared concurrency bound and transient-error retry
// =============================================================================
//
// A single semaphore bounds simultaneous REST calls across every caller that
// shares the HTTP session; callers over the bound wait rather than spill
// requests at the exchange. Transient failures (5xx, SSL, timeouts) retry
// with exponential backoff — 502s in particular deserve a couple of retries
// before anyone panics.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::warn;

use crate::error::Result;

/// Simultaneous REST calls allowed through the shared HTTP session.
pub const REST_CONCURRENCY: usize = 5;

/// Default retry count for transient errors.
pub const DEFAULT_RETRIES: u32 = 3;

/// Base delay of the exponential backoff schedule.
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Concurrency limiter for the shared REST session.
pub struct RestLimiter {
    semaphore: Semaphore,
}

impl RestLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrent),
        }
    }

    /// Wait for a slot. The permit releases on drop.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("REST limiter semaphore closed")
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for RestLimiter {
    fn default() -> Self {
        Self::new(REST_CONCURRENCY)
    }
}

/// Run `op`, retrying transient errors with exponential backoff. Rejects and
/// invariant violations are returned immediately — only wire-level trouble
/// earns another attempt.
pub async fn with_retries<T, F, Fut>(op_name: &str, max_retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = BACKOFF_BASE * 2u32.saturating_pow(attempt);
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient error — retrying with backoff"
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
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retries("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::ExchangeTransient("502 bad gateway".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejects_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = with_retries("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(EngineError::ExchangeReject {
                    code: "51006".into(),
                    message: "px out of band".into(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let result: Result<u32> = with_retries("test", 2, || async {
            Err(EngineError::ExchangeTransient("timeout".into()))
        })
        .await;
        assert!(matches!(result, Err(EngineError::ExchangeTransient(_))));
    }

    #[tokio::test]
    async fn limiter_bounds_concurrency() {
        let limiter = RestLimiter::new(2);
        let p1 = limiter.acquire().await;
        let _p2 = limiter.acquire().await;
        assert_eq!(limiter.available(), 0);
        drop(p1);
        assert_eq!(limiter.available(), 1);
    }
}
