//! Generic retry/timeout engine (§4.D).
//!
//! Generic over the success type and driven by
//! [`PublisherError::is_retryable`] rather than a hardcoded fault list.

use std::future::Future;
use std::time::Duration;

use crate::error::{PublisherError, PublisherResult};

/// Backoff delays applied between attempts, in order: `1s · 2^(i-1)`,
/// giving `maxAttempts=3` total tries (the initial attempt plus these
/// two retries).
const RETRY_DELAYS_MS: [u64; 2] = [1000, 2000];

/// Per-call timeout applied to each individual attempt, regardless of how
/// many retries have already elapsed.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes `operation` with retry-on-transient-error and a per-attempt
/// timeout, generic over `T` and driven by
/// [`PublisherError::is_retryable`].
///
/// `label` is used only for logging.
pub async fn with_retry<F, Fut, T>(label: &str, operation: F) -> PublisherResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PublisherResult<T>>,
{
    with_retry_timeout(label, DEFAULT_CALL_TIMEOUT, operation).await
}

/// As [`with_retry`], but with an explicit per-attempt timeout (§4.D,
/// "per-call-class timeouts").
pub async fn with_retry_timeout<F, Fut, T>(
    label: &str,
    call_timeout: Duration,
    mut operation: F,
) -> PublisherResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PublisherResult<T>>,
{
    let mut last_error = None;

    for (attempt, delay_ms) in std::iter::once(0).chain(RETRY_DELAYS_MS.iter().copied()).enumerate() {
        if attempt > 0 {
            log::info!(
                "retrying {label} (attempt {}/{}) after {delay_ms}ms",
                attempt + 1,
                RETRY_DELAYS_MS.len() + 1,
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        match tokio::time::timeout(call_timeout, operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_retryable() => {
                log::warn!("{label} transient error: {e}");
                last_error = Some(e);
            }
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => {
                log::warn!("{label} timed out after {call_timeout:?}");
                last_error = Some(PublisherError::Timeout(call_timeout));
            }
        }
    }

    Err(last_error.expect("retry loop always attempts at least once"))
}
