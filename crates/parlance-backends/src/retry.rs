//! Bounded exponential backoff for backend calls.
//!
//! Schedule: base → 2·base → 4·base … per attempt, cancellation-aware.
//! Only transient errors consume retry attempts; a non-transient error
//! returns immediately.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{BackendError, Result};

/// Per-backend retry budgets: the count is total attempts, not retries.
pub const LLM_ATTEMPTS: u32 = 3;
pub const TOOL_ATTEMPTS: u32 = 2;
pub const TTS_ATTEMPTS: u32 = 1;

pub const BASE_DELAY_MS: u64 = 250;

pub async fn with_backoff<T, F, Fut>(
    label: &str,
    attempts: u32,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(BASE_DELAY_MS);
    let mut last = String::new();

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    backend = label,
                    attempt,
                    max = attempts,
                    error = %e,
                    retry_after_ms = delay.as_millis() as u64,
                    "transient backend error, retrying"
                );
                last = e.to_string();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay *= 2;
            }
            Err(e) if e.is_transient() => {
                return Err(BackendError::Exhausted {
                    attempts,
                    last: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    Err(BackendError::Exhausted { attempts, last })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> BackendError {
        BackendError::Timeout { secs: 1 }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_budget() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<()> = with_backoff("llm", 3, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(matches!(result, Err(BackendError::Exhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_fails_fast() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<()> = with_backoff("tool", 5, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(BackendError::Api {
                    status: 401,
                    body: "bad key".to_string(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(BackendError::Api { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = with_backoff("tts", 2, &cancel, || async { Ok(()) }).await;
        assert!(matches!(result, Err(BackendError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = with_backoff("llm", 3, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }
}
