//! Resilient HTTP Client (C1): semaphore-bounded, circuit-breaker-guarded,
//! hedged requests against Instagram's private API. Ported from the
//! `ResilientAPIClient`/`_execute_parallel_requests` staggered-hedging
//! protocol: launch one request, and if it hasn't answered by the time a
//! fair share of the deadline has elapsed, launch another in parallel,
//! racing them and keeping the first success.

pub mod metrics;

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{HttpClientConfig, RateLimiterConfig};
use crate::credentials::CredentialRotator;
use crate::error::Error;
use crate::rate_limiter;

use metrics::ApiMetrics;

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl ResponseBody {
    pub fn into_json(self) -> crate::Result<Value> {
        match self {
            ResponseBody::Json(v) => Ok(v),
            ResponseBody::Text(t) => {
                serde_json::from_str(&t).map_err(|e| Error::network(format!("response was not JSON: {e}")))
            }
            ResponseBody::Bytes(_) => Err(Error::network("response was binary, expected JSON")),
        }
    }
}

pub struct ResilientHttpClient {
    config: HttpClientConfig,
    rate_limiter_config: RateLimiterConfig,
    client: Mutex<Client>,
    semaphore: Arc<Semaphore>,
    breaker: Arc<CircuitBreaker>,
    credentials: Arc<CredentialRotator>,
    metrics: Mutex<ApiMetrics>,
}

impl ResilientHttpClient {
    pub fn new(
        config: HttpClientConfig,
        rate_limiter_config: RateLimiterConfig,
        breaker: Arc<CircuitBreaker>,
        credentials: Arc<CredentialRotator>,
    ) -> crate::Result<Self> {
        let client = build_client(&config)?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            rate_limiter_config,
            client: Mutex::new(client),
            breaker,
            credentials,
            metrics: Mutex::new(ApiMetrics::default()),
        })
    }

    pub async fn metrics(&self) -> ApiMetrics {
        self.metrics.lock().await.clone()
    }

    /// Main entry point: rate-limits, acquires a concurrency permit, runs
    /// the request through the circuit breaker, and hedges across up to
    /// `max_parallel_requests` staggered attempts.
    pub async fn request(&self, method: Method, url: &str) -> crate::Result<ResponseBody> {
        self.request_with_headers(method, url, &[]).await
    }

    /// Like `request`, but attaches extra headers to every hedged attempt
    /// (Referer, mobile `x-csrftoken`/`x-ig-app-id`/`x-asbd-id` headers,
    /// etc. — callers assemble these per §4.5).
    pub async fn request_with_headers(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
    ) -> crate::Result<ResponseBody> {
        self.maybe_reset_metrics().await;
        rate_limiter::throttle(&self.rate_limiter_config).await;

        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::network("http client semaphore closed"))?;

        {
            let mut m = self.metrics.lock().await;
            m.total_requests += 1;
        }

        let result = self
            .breaker
            .execute(|| self.execute_parallel_requests(method, url, headers))
            .await;

        let mut m = self.metrics.lock().await;
        match &result {
            Ok(_) => m.successful_requests += 1,
            Err(Error::CircuitOpen) => m.circuit_breaker_trips += 1,
            Err(_) => m.failed_requests += 1,
        }
        drop(m);

        self.refresh_session_if_needed().await?;
        result
    }

    /// Staggered hedging: request 1 launches immediately; if it hasn't
    /// resolved after one `individual_timeout` slice, request 2 launches
    /// alongside it; same again for request 3. All pending attempts race;
    /// the first success wins and the rest are cancelled.
    async fn execute_parallel_requests(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
    ) -> crate::Result<ResponseBody> {
        let total_timeout = Duration::from_secs(self.config.request_timeout_secs);
        let num_parallel = self.calculate_parallel_requests().max(1);
        let individual_timeout = total_timeout / (num_parallel as u32 + 1);

        let mut handles = Vec::with_capacity(num_parallel);
        handles.push(self.spawn_attempt(method.clone(), url.to_string(), headers.to_vec()));

        {
            let mut m = self.metrics.lock().await;
            m.parallel_requests_sent += 1;
        }

        for _ in 1..num_parallel {
            tokio::select! {
                _ = tokio::time::sleep(individual_timeout) => {
                    handles.push(self.spawn_attempt(method.clone(), url.to_string(), headers.to_vec()));
                    let mut m = self.metrics.lock().await;
                    m.parallel_requests_sent += 1;
                }
                result = first_ready(&mut handles) => {
                    if let Some(result) = result {
                        self.cancel_remaining(&handles).await;
                        return self.finish(result).await;
                    }
                }
            }
        }

        let grace = Duration::from_millis(500);
        let deadline = tokio::time::sleep(total_timeout + grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    self.cancel_remaining(&handles).await;
                    return Err(Error::network(format!("all hedged attempts against {url} timed out")));
                }
                result = first_ready(&mut handles) => {
                    match result {
                        Some(result) => {
                            self.cancel_remaining(&handles).await;
                            return self.finish(result).await;
                        }
                        None => {
                            self.cancel_remaining(&handles).await;
                            return Err(Error::network(format!("all hedged attempts against {url} failed")));
                        }
                    }
                }
            }
        }
    }

    async fn finish(&self, result: crate::Result<ResponseBody>) -> crate::Result<ResponseBody> {
        if result.is_ok() {
            let mut m = self.metrics.lock().await;
            m.fastest_wins += 1;
        }
        result
    }

    async fn cancel_remaining(&self, handles: &[tokio::task::JoinHandle<crate::Result<ResponseBody>>]) {
        let mut cancelled = 0;
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            let mut m = self.metrics.lock().await;
            m.cancelled_requests += cancelled;
        }
    }

    fn spawn_attempt(
        &self,
        method: Method,
        url: String,
        headers: Vec<(String, String)>,
    ) -> tokio::task::JoinHandle<crate::Result<ResponseBody>> {
        let client_timeout = Duration::from_secs(self.config.sock_read_secs);
        let credentials = self.credentials.clone();
        let client_ref = &self.client;
        // SAFETY-free approach: clone the underlying reqwest::Client handle
        // (cheap, it's an Arc internally) rather than holding the mutex
        // across the spawned task's lifetime.
        let client_fut = async move { client_ref.lock().await.clone() };
        tokio::spawn(async move {
            let client = client_fut.await;
            let (cookie, user_agent) = credentials.next()?;
            make_single_request(&client, method, &url, &cookie, &user_agent, &headers, client_timeout).await
        })
    }

    fn calculate_parallel_requests(&self) -> usize {
        let available_slots = self.semaphore.available_permits();
        let max_parallel = self.config.max_parallel_requests;

        if available_slots <= 2 {
            return 1;
        }
        let load = 1.0 - (available_slots as f64 / self.config.max_concurrent.max(1) as f64);
        if load < 0.3 {
            max_parallel
        } else if load < 0.6 {
            max_parallel.saturating_sub(1).max(1)
        } else {
            1
        }
    }

    async fn maybe_reset_metrics(&self) {
        let mut m = self.metrics.lock().await;
        if m.should_reset(Duration::from_secs(self.config.metrics_window_secs)) {
            m.reset();
        }
    }

    /// Rebuilds the underlying `reqwest::Client` when the recent success
    /// rate drops below 70%, mirroring the source's session-refresh trigger.
    async fn refresh_session_if_needed(&self) -> crate::Result<()> {
        let should_refresh = {
            let m = self.metrics.lock().await;
            m.total_requests >= 10 && m.success_rate() < 0.7
        };
        if should_refresh {
            warn!("http client success rate degraded, refreshing session");
            let new_client = build_client(&self.config)?;
            *self.client.lock().await = new_client;
            let mut m = self.metrics.lock().await;
            m.session_refreshes += 1;
        }
        Ok(())
    }
}

async fn first_ready(
    handles: &mut Vec<tokio::task::JoinHandle<crate::Result<ResponseBody>>>,
) -> Option<crate::Result<ResponseBody>> {
    if handles.is_empty() {
        return None;
    }
    loop {
        let (result, index, _remaining) = futures::future::select_all(handles.iter_mut()).await;
        handles.remove(index);
        match result {
            Ok(Ok(body)) => return Some(Ok(body)),
            Ok(Err(e)) => {
                if handles.is_empty() {
                    return Some(Err(e));
                }
                debug!(error = %e, "hedged attempt failed, awaiting remaining attempts");
                continue;
            }
            Err(_join_err) => {
                if handles.is_empty() {
                    return None;
                }
                continue;
            }
        }
    }
}

/// Public web app id used by Instagram's private mobile/web-graphql
/// endpoints. Sent as `x-ig-app-id` on every call alongside the
/// cookie-derived csrftoken, per §4.5's "Instagram-specific mobile
/// headers ... assembled per call" policy.
const IG_APP_ID: &str = "936619743392459";
const IG_ASBD_ID: &str = "198387";

async fn make_single_request(
    client: &Client,
    method: Method,
    url: &str,
    cookie: &str,
    user_agent: &str,
    headers: &[(String, String)],
    timeout: Duration,
) -> crate::Result<ResponseBody> {
    let mut builder = client
        .request(method, url)
        .header(reqwest::header::COOKIE, cookie)
        .header(reqwest::header::USER_AGENT, user_agent)
        .header("x-ig-app-id", IG_APP_ID)
        .header("x-asbd-id", IG_ASBD_ID)
        .header("x-ig-www-claim", "0")
        .timeout(timeout);
    if let Some(csrftoken) = csrftoken_from_cookie(cookie) {
        builder = builder.header("x-csrftoken", csrftoken);
    }
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let response = builder
        .send()
        .await
        .map_err(|e| Error::network(format!("request to {url} failed: {e}")))?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::RateLimit(format!("429 from {url}")));
    }
    if status.is_server_error() {
        return Err(Error::HttpError(status.as_u16(), format!("server error from {url}")));
    }
    if status.is_client_error() {
        return Err(Error::HttpError(status.as_u16(), format!("client error from {url}")));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type.contains("application/json") {
        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::network(format!("invalid JSON body from {url}: {e}")))?;
        Ok(ResponseBody::Json(value))
    } else if content_type.starts_with("text/") {
        let text = response
            .text()
            .await
            .map_err(|e| Error::network(format!("invalid text body from {url}: {e}")))?;
        Ok(ResponseBody::Text(text))
    } else {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::network(format!("invalid byte body from {url}: {e}")))?;
        Ok(ResponseBody::Bytes(bytes.to_vec()))
    }
}

fn csrftoken_from_cookie(cookie: &str) -> Option<String> {
    cookie
        .split(';')
        .find_map(|part| part.trim().strip_prefix("csrftoken="))
        .map(|s| s.to_string())
}

fn build_client(config: &HttpClientConfig) -> crate::Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .tcp_keepalive(Duration::from_secs(config.keepalive_secs))
        .cookie_store(false)
        .build()
        .map_err(|e| Error::config(format!("failed to build http client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, RateLimiterConfig};
    use crate::parser_config::ParserConfigStore;
    use wiremock::matchers::method as wm_method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rate_limiter_config() -> RateLimiterConfig {
        RateLimiterConfig {
            base_delay_secs: 0.0,
            jitter_max: 0.0,
            additional_delay_min_secs: 0.0,
            additional_delay_max_secs: 0.0,
        }
    }

    fn http_config() -> HttpClientConfig {
        HttpClientConfig {
            max_concurrent: 5,
            request_timeout_secs: 2,
            connect_timeout_secs: 1,
            sock_read_secs: 2,
            sock_connect_secs: 1,
            max_parallel_requests: 2,
            metrics_window_secs: 3600,
            keepalive_secs: 5,
            dns_cache_secs: 60,
        }
    }

    fn rotator() -> Arc<CredentialRotator> {
        let dir = tempfile::tempdir().unwrap();
        let store = ParserConfigStore::new(dir.path().join("c.json")).unwrap();
        std::mem::forget(dir);
        Arc::new(CredentialRotator::new(store))
    }

    #[tokio::test]
    async fn successful_request_returns_json_body() {
        let server = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let breaker = Arc::new(CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }));
        let client = ResilientHttpClient::new(http_config(), rate_limiter_config(), breaker, rotator()).unwrap();

        let body = client.request(Method::GET, &server.uri()).await.unwrap();
        let json = body.into_json().unwrap();
        assert_eq!(json["ok"], true);
    }

    #[tokio::test]
    async fn rate_limited_response_surfaces_as_rate_limit_error() {
        let server = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let breaker = Arc::new(CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }));
        let client = ResilientHttpClient::new(http_config(), rate_limiter_config(), breaker, rotator()).unwrap();

        let result = client.request(Method::GET, &server.uri()).await;
        assert!(result.is_err());
    }

    #[test]
    fn csrftoken_is_extracted_from_cookie_string() {
        assert_eq!(
            csrftoken_from_cookie("sessionid=abc; csrftoken=xyz123; ds_user_id=1"),
            Some("xyz123".to_string())
        );
        assert_eq!(csrftoken_from_cookie("sessionid=abc"), None);
    }

    #[tokio::test]
    async fn extra_headers_are_sent_alongside_mobile_headers() {
        let server = MockServer::start().await;
        Mock::given(wm_method("GET"))
            .and(wiremock::matchers::header("referer", "https://www.instagram.com/alice/"))
            .and(wiremock::matchers::header("x-ig-app-id", IG_APP_ID))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let breaker = Arc::new(CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }));
        let client = ResilientHttpClient::new(http_config(), rate_limiter_config(), breaker, rotator()).unwrap();

        let headers = vec![("referer".to_string(), "https://www.instagram.com/alice/".to_string())];
        let body = client
            .request_with_headers(Method::GET, &server.uri(), &headers)
            .await
            .unwrap();
        assert_eq!(body.into_json().unwrap()["ok"], true);
    }

    #[test]
    fn parallel_request_count_drops_under_load() {
        let breaker = Arc::new(CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }));
        let client = ResilientHttpClient::new(http_config(), rate_limiter_config(), breaker, rotator()).unwrap();
        assert_eq!(client.calculate_parallel_requests(), 2);
    }
}
