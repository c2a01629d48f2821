//! Bounded retries with exponential backoff

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use transfers_types::{Error, RetryConfig, Result};

/// Which errors a retry loop gives another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    /// Transient I/O only, used around byte transfers
    TransientIo,
    /// Transient I/O plus unclassified service errors, used around bookkeeping
    ServiceErrors,
}

impl RetryOn {
    /// Whether `error` should be retried under this policy. Cancellation never is.
    pub fn matches(self, error: &Error) -> bool {
        if error.is_cancelled() {
            return false;
        }
        match self {
            Self::TransientIo => error.is_retryable(),
            Self::ServiceErrors => error.is_retryable() || matches!(error, Error::Other { .. }),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error or runs out of
/// attempts. Sleeps between attempts are cut short by `cancel`, which turns
/// into [`Error::Cancelled`].
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    retry_on: RetryOn,
    what: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts && retry_on.matches(&error) => {
                let delay = config.delay_for_attempt(attempt - 1);
                warn!(
                    operation = what,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after error: {}",
                    error
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[rstest]
    #[case(Error::io("reset"), RetryOn::TransientIo, true)]
    #[case(Error::other("db hiccup"), RetryOn::TransientIo, false)]
    #[case(Error::other("db hiccup"), RetryOn::ServiceErrors, true)]
    #[case(Error::Cancelled, RetryOn::ServiceErrors, false)]
    #[case(Error::not_found("x"), RetryOn::ServiceErrors, false)]
    #[case(Error::validation("bad"), RetryOn::TransientIo, false)]
    fn test_policy(#[case] error: Error, #[case] policy: RetryOn, #[case] expected: bool) {
        assert_eq!(policy.matches(&error), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry_with_backoff(
            &RetryConfig::transfer_default(),
            RetryOn::TransientIo,
            "upload",
            &CancellationToken::new(),
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::io("flaky"))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry_with_backoff(
            &RetryConfig::immediate(4),
            RetryOn::TransientIo,
            "upload",
            &CancellationToken::new(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::io("down")) }
            },
        )
        .await;
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry_with_backoff(
            &RetryConfig::immediate(5),
            RetryOn::ServiceErrors,
            "activate",
            &CancellationToken::new(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::not_found("child")) }
            },
        )
        .await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let config = RetryConfig::new(
            10,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            2.0,
        )
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = retry_with_backoff(
            &config,
            RetryOn::TransientIo,
            "upload",
            &cancel,
            |_| async { Err(Error::io("down")) },
        )
        .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
