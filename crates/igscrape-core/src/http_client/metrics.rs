//! Rolling counters for the resilient HTTP client (C1), mirroring the
//! `APIMetrics` dataclass this was ported from.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ApiMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub circuit_breaker_trips: u64,
    pub session_refreshes: u64,
    pub parallel_requests_sent: u64,
    pub fastest_wins: u64,
    pub cancelled_requests: u64,
    pub last_reset: Instant,
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            circuit_breaker_trips: 0,
            session_refreshes: 0,
            parallel_requests_sent: 0,
            fastest_wins: 0,
            cancelled_requests: 0,
            last_reset: Instant::now(),
        }
    }
}

impl ApiMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    pub fn should_reset(&self, window: Duration) -> bool {
        self.last_reset.elapsed() > window
    }

    pub fn reset(&mut self) {
        *self = ApiMetrics {
            last_reset: Instant::now(),
            ..ApiMetrics::default()
        };
    }
}
