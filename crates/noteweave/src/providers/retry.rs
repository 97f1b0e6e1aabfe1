//! Retry with exponential backoff for transient provider failures

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::config::RetryPolicy;
use crate::error::{Error, ProviderErrorKind, Result};

/// Run `operation` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts. Each attempt is bounded by `attempt_timeout`; an attempt that
/// exceeds it counts as a retryable timeout.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    label: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        let result = match timeout(attempt_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(Error::provider(
                label,
                ProviderErrorKind::Timeout,
                format!("no response within {:?}", attempt_timeout),
            )),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label,
                    attempt + 1,
                    policy.max_retries + 1,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
