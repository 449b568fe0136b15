use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::warn;

/// How long to wait, and how many times, before giving up on a logical call.
///
/// Grounded in the coefficient/initial/maximum shape of `hook-common`'s queue
/// retry policy, generalized from "next scheduled_at for a job row" to "next
/// sleep before retrying a closure in-process".
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_base: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff_base: 2,
        }
    }

    /// Delay before the given attempt (0-indexed), capped at `max_delay`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let candidate = self.base_delay * self.backoff_base.pow(attempt);
        std::cmp::min(candidate, self.max_delay)
    }

    /// A downloader needs a wider budget than a single metadata call.
    pub fn widened(&self, extra_attempts: u32) -> Self {
        Self {
            max_attempts: self.max_attempts + extra_attempts,
            ..*self
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_base: 2,
        }
    }
}

/// Distinguishes a failure worth retrying from one that should propagate
/// immediately. Closures passed to [`retry`] return this instead of a bare
/// error so the engine never has to guess from the error's shape.
#[derive(Debug)]
pub enum RetryableError<E> {
    Retryable(E),
    Terminal(E),
}

/// Higher-order retry wrapper: runs `f` up to `policy.max_attempts` times,
/// sleeping between attempts when the error is classified as retryable, and
/// returning immediately on success or on a terminal error.
///
/// `op_name` is only used for logging, so attempts can be correlated in
/// traces without threading a span through every caller.
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, op_name: &str, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryableError<E>>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(RetryableError::Terminal(err)) => return Err(err),
            Err(RetryableError::Retryable(err)) => {
                attempt += 1;
                metrics::counter!("ingestion_retry_attempts_total", "operation" => op_name.to_string()).increment(1);
                if attempt >= policy.max_attempts {
                    warn!(
                        operation = op_name,
                        attempt, "giving up after exhausting retry budget"
                    );
                    metrics::counter!("ingestion_retry_exhausted_total", "operation" => op_name.to_string())
                        .increment(1);
                    return Err(err);
                }
                let delay = policy.delay_for(attempt - 1);
                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// True for the HTTP statuses the pipeline treats as transient: request
/// timeout, rate limiting, and server errors.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Convenience wrapper over [`retry`] for plain HTTP calls: classifies
/// transport errors (timeout, connect) and the status codes from
/// [`is_retryable_status`] as retryable, everything else as terminal.
pub async fn retry_http<F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut f: F,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    retry(policy, op_name, move || {
        let fut = f();
        async move {
            match fut.await {
                Ok(resp) if is_retryable_status(resp.status()) => {
                    Err(RetryableError::Retryable(
                        resp.error_for_status().unwrap_err(),
                    ))
                }
                Ok(resp) => Ok(resp),
                Err(err) if err.is_timeout() || err.is_connect() || err.is_request() => {
                    Err(RetryableError::Retryable(err))
                }
                Err(err) => Err(RetryableError::Terminal(err)),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1)); // capped
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(10));
        let result: Result<u32, &str> = retry(&policy, "test-op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RetryableError::Retryable("not yet"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(10));
        let result: Result<u32, &str> = retry(&policy, "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(RetryableError::Terminal("nope")) }
        })
        .await;
        assert_eq!(result, Err("nope"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(10));
        let result: Result<u32, &str> = retry(&policy, "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(RetryableError::Retryable("still failing")) }
        })
        .await;
        assert_eq!(result, Err("still failing"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retryable_status_classification() {
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::OK));
    }

    #[test]
    fn widened_adds_attempts_only() {
        let policy = RetryPolicy::default();
        let wide = policy.widened(2);
        assert_eq!(wide.max_attempts, policy.max_attempts + 2);
        assert_eq!(wide.base_delay, policy.base_delay);
    }
}
