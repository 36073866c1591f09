//! Layered configuration (C15): compiled-in defaults, overridden by a
//! TOML file, with the file path itself resolved from the environment.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http_client: HttpClientConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    #[serde(default)]
    pub parser_config_path: ParserConfigPathConfig,

    #[serde(default)]
    pub payment_gateway: PaymentGatewayConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub tasks: TaskConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_client: HttpClientConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            parser_config_path: ParserConfigPathConfig::default(),
            payment_gateway: PaymentGatewayConfig::default(),
            notifications: NotificationConfig::default(),
            cache: CacheConfig::default(),
            tasks: TaskConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read config file {path}: {e}")))?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks `IGSCRAPE_CONFIG` first, then a short list of conventional
    /// paths, falling back to compiled-in defaults if none exist.
    pub fn from_env() -> crate::Result<Self> {
        if let Ok(config_path) = std::env::var("IGSCRAPE_CONFIG") {
            return Self::load(&config_path);
        }

        let default_paths = ["./config/default.toml", "/etc/igscrape/config.toml"];
        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        let defaults = Self::default();
        defaults.validate()?;
        Ok(defaults)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.http_client.max_concurrent == 0 {
            return Err(Error::config("http_client.max_concurrent must be > 0"));
        }
        if self.http_client.max_parallel_requests == 0 {
            return Err(Error::config("http_client.max_parallel_requests must be > 0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::config("circuit_breaker.failure_threshold must be > 0"));
        }
        if !self.payment_gateway.test_mode
            && (self.payment_gateway.public_id.is_empty() || self.payment_gateway.api_secret.is_empty())
        {
            return Err(Error::config(
                "payment_gateway credentials must be set when test_mode is false",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_sock_read_secs")]
    pub sock_read_secs: u64,
    #[serde(default = "default_sock_connect_secs")]
    pub sock_connect_secs: u64,
    #[serde(default = "default_max_parallel_requests")]
    pub max_parallel_requests: usize,
    #[serde(default = "default_metrics_window_secs")]
    pub metrics_window_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_dns_cache_secs")]
    pub dns_cache_secs: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            sock_read_secs: default_sock_read_secs(),
            sock_connect_secs: default_sock_connect_secs(),
            max_parallel_requests: default_max_parallel_requests(),
            metrics_window_secs: default_metrics_window_secs(),
            keepalive_secs: default_keepalive_secs(),
            dns_cache_secs: default_dns_cache_secs(),
        }
    }
}

fn default_max_concurrent() -> usize {
    10
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    3
}
fn default_sock_read_secs() -> u64 {
    8
}
fn default_sock_connect_secs() -> u64 {
    3
}
fn default_max_parallel_requests() -> usize {
    3
}
fn default_metrics_window_secs() -> u64 {
    3600
}
fn default_keepalive_secs() -> u64 {
    15
}
fn default_dns_cache_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,
    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
    #[serde(default = "default_additional_delay_min")]
    pub additional_delay_min_secs: f64,
    #[serde(default = "default_additional_delay_max")]
    pub additional_delay_max_secs: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            jitter_max: default_jitter_max(),
            additional_delay_min_secs: default_additional_delay_min(),
            additional_delay_max_secs: default_additional_delay_max(),
        }
    }
}

fn default_base_delay_secs() -> f64 {
    15.0
}
fn default_jitter_max() -> f64 {
    0.5
}
fn default_additional_delay_min() -> f64 {
    1.0
}
fn default_additional_delay_max() -> f64 {
    3.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfigPathConfig {
    #[serde(default = "default_parser_config_path")]
    pub path: String,
}

impl Default for ParserConfigPathConfig {
    fn default() -> Self {
        Self {
            path: default_parser_config_path(),
        }
    }
}

fn default_parser_config_path() -> String {
    "parser_config.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentGatewayConfig {
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub public_id: String,
    #[serde(default)]
    pub api_secret: String,
}

impl Default for PaymentGatewayConfig {
    fn default() -> Self {
        Self {
            test_mode: true,
            public_id: String::new(),
            api_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_notifications_enabled")]
    pub enabled: bool,
    #[serde(default = "default_notification_delay_short_secs")]
    pub delay_short_secs: u64,
    #[serde(default = "default_notification_delay_long_secs")]
    pub delay_long_secs: u64,
    #[serde(default = "default_mini_app_url")]
    pub mini_app_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: default_notifications_enabled(),
            delay_short_secs: default_notification_delay_short_secs(),
            delay_long_secs: default_notification_delay_long_secs(),
            mini_app_url: default_mini_app_url(),
        }
    }
}

fn default_notifications_enabled() -> bool {
    true
}
fn default_notification_delay_short_secs() -> u64 {
    300
}
fn default_notification_delay_long_secs() -> u64 {
    345_600
}
fn default_mini_app_url() -> String {
    String::new()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_freshness_ttl_secs")]
    pub freshness_ttl_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            freshness_ttl_secs: default_freshness_ttl_secs(),
        }
    }
}

fn default_freshness_ttl_secs() -> i64 {
    86_400
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_task_ttl_secs")]
    pub status_ttl_secs: i64,
    #[serde(default = "default_task_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Recurring-payments sweep cadence (§4.11: "tick period 60s").
    #[serde(default = "default_payment_scheduler_tick_secs")]
    pub payment_scheduler_tick_secs: u64,
    /// Notification delivery loop cadence (§4.12: "Delivery loop (60s tick)").
    #[serde(default = "default_notification_tick_secs")]
    pub notification_tick_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            status_ttl_secs: default_task_ttl_secs(),
            sweep_interval_secs: default_task_sweep_interval_secs(),
            payment_scheduler_tick_secs: default_payment_scheduler_tick_secs(),
            notification_tick_secs: default_notification_tick_secs(),
        }
    }
}

fn default_task_ttl_secs() -> i64 {
    3600
}
fn default_task_sweep_interval_secs() -> u64 {
    300
}
fn default_payment_scheduler_tick_secs() -> u64 {
    60
}
fn default_notification_tick_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
