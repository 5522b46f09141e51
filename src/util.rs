//! Small cross-cutting helpers shared by more than one module.

use std::future::Future;
use std::time::Duration;

/// Retry an async operation up to `attempts` times with exponential backoff
/// bounded to `[min_delay, max_delay]`. The operation runs at least once; the
/// last error is returned if every attempt fails.
pub async fn with_retries<T, E, F, Fut>(
    attempts: u32,
    min_delay: Duration,
    max_delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = min_delay;
    let mut last_err = None;

    for attempt in 0..attempts.max(1) {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }

    Err(last_err.expect("loop runs at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_first_try_without_delay() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_retries(3, Duration::from_millis(1), Duration::from_millis(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_retries(3, Duration::from_millis(1), Duration::from_millis(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("not yet") } else { Ok(7) } }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_after_exhausting_attempts() {
        let result: Result<u32, &str> =
            with_retries(3, Duration::from_millis(1), Duration::from_millis(5), || async { Err("nope") }).await;
        assert_eq!(result, Err("nope"));
    }
}
