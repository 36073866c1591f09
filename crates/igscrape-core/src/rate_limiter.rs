//! Rate Limiter (C4): a stateless delay function. No token bucket, no
//! shared counters — every caller just awaits a randomized sleep before
//! issuing its next request, mirroring the source's per-request
//! `asyncio.sleep(base_delay + jitter)` calls rather than a centralized
//! limiter service.

use rand::Rng;
use std::time::Duration;

use crate::config::RateLimiterConfig;

/// Sleeps for `base_delay + U[0, base_delay*jitter_max] + U[delay_min, delay_max]`.
pub async fn throttle(config: &RateLimiterConfig) {
    let delay = compute_delay(config);
    tokio::time::sleep(delay).await;
}

pub fn compute_delay(config: &RateLimiterConfig) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter = rng.gen_range(0.0..=(config.base_delay_secs * config.jitter_max).max(0.0));
    let extra = if config.additional_delay_max_secs > config.additional_delay_min_secs {
        rng.gen_range(config.additional_delay_min_secs..=config.additional_delay_max_secs)
    } else {
        config.additional_delay_min_secs
    };
    let total_secs = config.base_delay_secs + jitter + extra;
    Duration::from_secs_f64(total_secs.max(0.0))
}
