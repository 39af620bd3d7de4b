//! Integration coverage for `retry::execute`/`execute_cancellable` composed
//! with realistic policies, beyond the formula-level unit tests in
//! `retry.rs`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rpc_mesh_core::retry::{execute, execute_cancellable};
use rpc_mesh_core::{MeshError, RetryPolicy};

#[tokio::test]
async fn no_retry_policy_calls_exactly_once_even_on_retryable_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);
    let result: Result<(), MeshError> = execute(&RetryPolicy::no_retry(), || {
        let calls = Arc::clone(&calls_clone);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MeshError::service_unavailable("down"))
        }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn eventual_success_returns_the_successful_value_not_an_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);
    let policy = RetryPolicy::new(5, 5, 100, 2.0);

    let result = execute(&policy, || {
        let calls = Arc::clone(&calls_clone);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 4 {
                Err(MeshError::connection("dial refused"))
            } else {
                Ok(42)
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn cancel_future_that_never_resolves_lets_retries_run_to_completion() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);
    let policy = RetryPolicy::new(3, 5, 100, 2.0);

    let result: Result<(), MeshError> = execute_cancellable(
        &policy,
        || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(MeshError::timeout("slow"))
            }
        },
        std::future::pending(),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn backoff_between_attempts_is_observable_as_elapsed_time() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = Arc::clone(&calls);
    let policy = RetryPolicy::new(3, 20, 1000, 2.0);

    let start = tokio::time::Instant::now();
    let _: Result<(), MeshError> = execute(&policy, || {
        let calls = Arc::clone(&calls_clone);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(MeshError::service_unavailable("down"))
        }
    })
    .await;

    // Two backoff sleeps of 20ms and 40ms between three attempts.
    assert!(start.elapsed() >= Duration::from_millis(55));
}
