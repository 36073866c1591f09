//! Core domain logic for the Instagram profile-ingestion and
//! recurring-payments engine: HTTP client hedging, circuit breaking,
//! credential rotation, scraping orchestration, job queueing, blob
//! storage, profile caching, and the payment/subscription lifecycle.

pub mod application;
pub mod blob_store;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http_client;
pub mod jobs;
pub mod models;
pub mod notifications;
pub mod parser_config;
pub mod payment;
pub mod payment_gateway;
pub mod payment_scheduler;
pub mod persistence;
pub mod rate_limiter;
pub mod scrape;

pub use application::{Application, RepositoryBundle};
pub use config::Config;
pub use error::{Error, ErrorCategory, Result};
