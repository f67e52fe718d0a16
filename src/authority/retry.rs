//! Retry with exponential backoff for transient authority failures.
//!
//! Only idempotent reads of authentication state go through here (token
//! refresh). Admin verification, rate-limit checks and audit appends are
//! single-shot: their failure policies (fail closed, fail open, fail silent)
//! apply on the first error.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Maximum retry attempts before giving up.
pub const MAX_RETRIES: u32 = 3;

/// First backoff step; doubles on every attempt.
const BASE_BACKOFF_MS: u64 = 250;

/// Cap on a single backoff step.
const MAX_BACKOFF_MS: u64 = 4_000;

/// Backoff before retry number `attempt` (zero-based).
pub fn backoff_for(attempt: u32) -> Duration {
    let ms = BASE_BACKOFF_MS
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(MAX_BACKOFF_MS);
    Duration::from_millis(ms)
}

/// Retry an async operation while `is_retryable` says the error is transient.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once `MAX_RETRIES` retries are spent.
pub async fn retry_with_backoff<F, Fut, T, E>(
    mut operation: F,
    is_retryable: fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable(&err) || attempt >= MAX_RETRIES {
                    return Err(err);
                }

                let backoff = backoff_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "authority call failed, retrying"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::traits::AuthorityError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    let count = attempt.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err(AuthorityError::Network("transient".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
            AuthorityError::is_transient,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    attempt.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(AuthorityError::Unauthorized)
                }
            },
            AuthorityError::is_transient,
        )
        .await;

        assert_eq!(result, Err(AuthorityError::Unauthorized));
        assert_eq!(attempt.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_retries() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    attempt.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(AuthorityError::Network("down".to_string()))
                }
            },
            AuthorityError::is_transient,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempt.load(Ordering::SeqCst), MAX_RETRIES + 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_for(0), Duration::from_millis(250));
        assert_eq!(backoff_for(1), Duration::from_millis(500));
        assert_eq!(backoff_for(2), Duration::from_millis(1_000));
        assert_eq!(backoff_for(10), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(backoff_for(u32::MAX), Duration::from_millis(MAX_BACKOFF_MS));
    }
}
