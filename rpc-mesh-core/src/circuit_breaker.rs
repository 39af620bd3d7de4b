//! Circuit breaker: fails fast after sustained failure against one target,
//! probes recovery after a cooldown.
//!
//! Struct shape (`failure_count`/`success_count`/`last_failure_time`,
//! `CLOSED`/`OPEN`/`HALF_OPEN`) is grounded on a reference service-discovery
//! client's `CircuitBreaker`; concurrency is re-expressed with atomics per
//! §5 ("atomic compare-and-swap; no coarse lock") instead of that
//! reference's plain `&mut self` mutation under an external `RwLock`.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

use tracing::{info, warn};

use crate::error::{ErrorKind, MeshError, Result};
use crate::types::{now_millis, CircuitBreakerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::Closed,
            1 => State::Open,
            _ => State::HalfOpen,
        }
    }
}

/// A per-target circuit breaker. Every transition is a CAS loop over a
/// packed `AtomicU8` state plus independent atomic counters; there is no
/// lock guarding the whole struct, so concurrent callers may race on the
/// individual counters but never observe a torn state.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    last_failure_time: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: AtomicU8::new(State::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_time: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns whether a call may proceed, performing the `OPEN ->
    /// HALF_OPEN` timeout transition if due.
    pub fn allow_request(&self) -> bool {
        match self.state() {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let elapsed = now_millis() - self.last_failure_time.load(Ordering::SeqCst);
                if elapsed as u64 >= self.config.timeout_ms {
                    if self
                        .state
                        .compare_exchange(
                            State::Open as u8,
                            State::HalfOpen as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        self.success_count.store(0, Ordering::SeqCst);
                        info!(target = %self.name, "circuit breaker half-open, probing recovery");
                    }
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful call. In `CLOSED` resets `failure_count`; in
    /// `HALF_OPEN` counts toward `success_threshold` and closes the
    /// breaker once reached.
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        if self.state() == State::HalfOpen {
            let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= self.config.success_threshold
                && self
                    .state
                    .compare_exchange(State::HalfOpen as u8, State::Closed as u8, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                self.success_count.store(0, Ordering::SeqCst);
                info!(target = %self.name, "circuit breaker closed after recovery");
            }
        }
    }

    /// Records a failed call. In `CLOSED`, opens once `failure_threshold`
    /// is reached. In `HALF_OPEN`, any failure reopens immediately.
    pub fn record_failure(&self) {
        self.last_failure_time.store(now_millis(), Ordering::SeqCst);

        match self.state() {
            State::HalfOpen => {
                if self
                    .state
                    .compare_exchange(State::HalfOpen as u8, State::Open as u8, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    warn!(target = %self.name, "circuit breaker reopened after half-open failure");
                }
            }
            State::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .compare_exchange(State::Closed as u8, State::Open as u8, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    warn!(target = %self.name, failures, "circuit breaker opened after threshold reached");
                }
            }
            State::Open => {}
        }
    }

    /// Forces `CLOSED` with zeroed counters.
    pub fn reset(&self) {
        self.state.store(State::Closed as u8, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        self.last_failure_time.store(0, Ordering::SeqCst);
    }

    /// Runs `op`, gating on `allow_request` and recording the outcome.
    /// Only `MeshError`s are counted; this is the sole error type in the
    /// crate, so every failure is framework-classified per §4.5.
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.allow_request() {
            return Err(MeshError::service_unavailable(format!(
                "circuit breaker open for target {}",
                self.name
            )));
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}

/// Propagation policy (§7): some kinds surface immediately without being
/// counted as a breaker failure at all, since the target itself is fine.
pub fn counts_as_breaker_failure(kind: ErrorKind) -> bool {
    !matches!(
        kind,
        ErrorKind::BadRequest | ErrorKind::Unauthorized | ErrorKind::Forbidden | ErrorKind::NotFound | ErrorKind::NotImplemented
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(failure_threshold: u32, success_threshold: u32, timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            timeout_ms,
        }
    }

    #[test]
    fn opens_on_threshold_scenario_s4() {
        let breaker = CircuitBreaker::new("calc", config(3, 2, 100));
        assert!(breaker.allow_request());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), State::Closed);
        breaker.record_failure();

        assert_eq!(breaker.state(), State::Open);
        assert!(!breaker.allow_request());
    }

    #[tokio::test]
    async fn half_opens_after_timeout_then_recovers() {
        let breaker = CircuitBreaker::new("calc", config(1, 1, 30));
        breaker.record_failure();
        assert_eq!(breaker.state(), State::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), State::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("calc", config(1, 2, 30));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), State::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn reset_forces_closed() {
        let breaker = CircuitBreaker::new("calc", config(1, 1, 30));
        breaker.record_failure();
        assert_eq!(breaker.state(), State::Open);
        breaker.reset();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn concurrent_failures_never_exceed_threshold_race() {
        let breaker = Arc::new(CircuitBreaker::new("calc", config(10, 2, 1000)));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let breaker = Arc::clone(&breaker);
            handles.push(tokio::spawn(async move {
                breaker.record_failure();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(breaker.state(), State::Open);
    }

    #[test]
    fn breaker_failure_predicate_excludes_client_errors() {
        assert!(!counts_as_breaker_failure(ErrorKind::NotFound));
        assert!(!counts_as_breaker_failure(ErrorKind::BadRequest));
        assert!(counts_as_breaker_failure(ErrorKind::Timeout));
        assert!(counts_as_breaker_failure(ErrorKind::InternalError));
    }
}
