//! Three-state circuit breaker (C2) wrapping outbound calls made by the
//! HTTP client. Mirrors the CLOSED/OPEN/HALF_OPEN state machine used by
//! the ingestion engine this was ported from, generalized to an async
//! `execute` that accepts any fallible future.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure_at: Option<Instant>,
    /// Set while the single half-open probe is in flight, so concurrent
    /// callers arriving during that window are rejected rather than all
    /// being let through as additional probes.
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// Runs `f`, transitioning the breaker state on success/failure.
    /// Returns `Error::CircuitOpen` immediately without running `f` if the
    /// breaker is open and the recovery timeout hasn't elapsed.
    pub async fn execute<F, Fut, T>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let is_probe = {
            let mut guard = self.inner.lock().await;
            match guard.state {
                BreakerState::Open => {
                    let elapsed = guard
                        .last_failure_at
                        .map(|t| t.elapsed())
                        .unwrap_or(Duration::MAX);
                    if elapsed > self.recovery_timeout {
                        info!("circuit breaker transitioning to half-open");
                        guard.state = BreakerState::HalfOpen;
                        guard.probe_in_flight = true;
                        true
                    } else {
                        return Err(Error::CircuitOpen);
                    }
                }
                BreakerState::HalfOpen => {
                    if guard.probe_in_flight {
                        return Err(Error::CircuitOpen);
                    }
                    guard.probe_in_flight = true;
                    true
                }
                BreakerState::Closed => false,
            }
        };

        match f().await {
            Ok(value) => {
                self.on_success(is_probe).await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure(is_probe).await;
                Err(e)
            }
        }
    }

    async fn on_success(&self, was_probe: bool) {
        let mut guard = self.inner.lock().await;
        guard.failures = 0;
        if was_probe {
            guard.probe_in_flight = false;
        }
        if guard.state == BreakerState::HalfOpen {
            info!("circuit breaker transitioning to closed");
            guard.state = BreakerState::Closed;
        }
    }

    async fn on_failure(&self, was_probe: bool) {
        let mut guard = self.inner.lock().await;
        guard.failures += 1;
        guard.last_failure_at = Some(Instant::now());
        if was_probe {
            guard.probe_in_flight = false;
        }

        if guard.failures >= self.failure_threshold || guard.state == BreakerState::HalfOpen {
            warn!(failures = guard.failures, "circuit breaker opening");
            guard.state = BreakerState::Open;
            guard.failures = 0;
        }
    }
}
