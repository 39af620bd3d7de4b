//! Re-runs an operation while its failure is classified retryable, under
//! exponential backoff.
//!
//! Generalizes the donor's `ConnectionManager::execute_with_retry` (a bare
//! loop embedded in the connection layer, keyed off
//! `DatabaseError::is_retryable()`) into a standalone executor operating
//! over the spec's closed `ErrorKind` set and [`RetryPolicy`], with a
//! cancellable sleep per §5 ("cancellation during retry backoff wakes the
//! sleeper").

use tracing::debug;

use crate::error::{ErrorKind, MeshError, Result};
use crate::types::RetryPolicy;

/// Re-runs `op` under `policy`, sleeping between retryable failures.
///
/// Non-retryable failures (kind not in `policy.retryable_error_kinds`, or
/// the final attempt) are returned immediately — the last error is always
/// what callers see, never a synthesized one.
pub async fn execute<F, Fut, T>(policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    execute_cancellable(policy, op, std::future::pending()).await
}

/// Same as [`execute`], but `cancel` can preempt the inter-attempt sleep.
/// When `cancel` resolves first, returns `Timeout` rather than continuing
/// to the next attempt.
pub async fn execute_cancellable<F, Fut, T, C>(policy: &RetryPolicy, mut op: F, mut cancel: C) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    C: std::future::Future<Output = ()> + Unpin,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 0..max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let is_last = attempt + 1 == max_attempts;
                if is_last || !policy.is_retryable(err.kind) {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, kind = ?err.kind, "retrying after backoff");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = &mut cancel => {
                        return Err(MeshError::wrap(ErrorKind::Timeout, "retry cancelled during backoff sleep", &err));
                    }
                }
            }
        }
    }
    unreachable!("loop always returns on its last iteration")
}
