use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Retry an async operation up to `max_attempts` times with exponential backoff.
///
/// `max_attempts` counts the first try. The error of the last attempt is returned.
pub async fn retry_async<F, Fut, T, E>(
    mut operation: F,
    max_attempts: usize,
    base_delay: Duration,
    factor: u32,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if attempt >= max_attempts => return Err(err),
            Err(_) => {
                let backoff = base_delay * factor.saturating_pow((attempt - 1) as u32);
                sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, String> = retry_async(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(format!("busy {}", n))
                } else {
                    Ok(42)
                }
            },
            5,
            Duration::from_millis(1),
            2,
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_last_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = retry_async(
            || async { Err(format!("attempt {}", calls.fetch_add(1, Ordering::SeqCst) + 1)) },
            3,
            Duration::from_millis(1),
            2,
        )
        .await;
        assert_eq!(result, Err("attempt 3".to_string()));
    }
}
