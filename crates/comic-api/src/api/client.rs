//! HTTP client with deduplication, rate limiting and retry logic.
//!
//! A request passes three gates in order:
//! 1. Deduplication: identical concurrent requests share one network call.
//! 2. Rate limiting: a denied request fails at once with `RATE_LIMIT`.
//! 3. Retry loop: transient failures are retried with exponential backoff.
//!
//! Every failure leaving this module is an [`ApiError`].

use super::cancel::CancellationToken;
use super::error::{normalize, ApiError, ErrorKind};
use super::rate_limiter::RateLimiter;
use super::transport::{ReqwestTransport, Transport};
use super::types::{RequestDescriptor, ResponseBody};
use anyhow::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use shared::config::ApiConfig;
use shared::Config;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Per-request behaviour
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Retries after the first attempt
    pub retries: u32,
    /// Base delay for exponential backoff
    pub retry_delay: Duration,
    pub enable_deduplication: bool,
    pub enable_rate_limit: bool,
    pub cancel: Option<CancellationToken>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_millis(1000),
            enable_deduplication: true,
            enable_rate_limit: true,
            cancel: None,
        }
    }
}

impl From<&ApiConfig> for RequestOptions {
    fn from(config: &ApiConfig) -> Self {
        Self {
            retries: config.retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            enable_deduplication: config.enable_deduplication,
            enable_rate_limit: config.enable_rate_limit,
            cancel: None,
        }
    }
}

impl RequestOptions {
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Delay before the retry following attempt `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

type SharedResponse = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

struct ClientInner {
    transport: Arc<dyn Transport>,
    rate_limiter: Mutex<RateLimiter>,
    in_flight: Mutex<HashMap<String, SharedResponse>>,
    defaults: RequestOptions,
}

/// Removes an in-flight entry when the owning task ends, however it ends
struct InFlightGuard {
    inner: Arc<ClientInner>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.lock_in_flight().remove(&self.key);
        debug!(key = %self.key, "In-flight request settled");
    }
}

/// Run `fut` unless `cancel` fires first
async fn or_cancel<F: Future>(
    cancel: Option<&CancellationToken>,
    fut: F,
) -> Result<F::Output, ApiError> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(ApiError::cancelled()),
            output = fut => Ok(output),
        },
        None => Ok(fut.await),
    }
}

/// Cheaply cloneable HTTP client; clones share state
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    /// Create a client from explicitly constructed parts
    pub fn new(
        transport: Arc<dyn Transport>,
        rate_limiter: RateLimiter,
        defaults: RequestOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                rate_limiter: Mutex::new(rate_limiter),
                in_flight: Mutex::new(HashMap::new()),
                defaults,
            }),
        }
    }

    /// Create a reqwest-backed client from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = ReqwestTransport::new(
            config.api.base_url.clone(),
            Duration::from_millis(config.api.timeout_ms),
        )?;

        info!(
            base_url = %transport.base_url(),
            timeout_ms = config.api.timeout_ms,
            retries = config.api.retries,
            "HTTP client initialized"
        );

        Ok(Self::new(
            Arc::new(transport),
            RateLimiter::new(config.rate_limit.clone()),
            RequestOptions::from(&config.api),
        ))
    }

    /// Options used when a caller does not supply its own
    pub fn defaults(&self) -> &RequestOptions {
        &self.inner.defaults
    }

    /// Issue a request with the default options
    pub async fn send(&self, descriptor: RequestDescriptor) -> Result<Value, ApiError> {
        self.request(descriptor, self.inner.defaults.clone()).await
    }

    /// Issue a request
    ///
    /// When deduplication is on and an identical request is already in flight,
    /// this waits for that request's result instead of calling the network.
    /// The options of the request that started the call govern retries and
    /// cancellation; a joining caller's token only abandons its own wait.
    pub async fn request(
        &self,
        descriptor: RequestDescriptor,
        options: RequestOptions,
    ) -> Result<Value, ApiError> {
        if !options.enable_deduplication {
            return self.inner.execute(&descriptor, &options).await;
        }

        let key = descriptor.dedup_key();
        let waiter_cancel = options.cancel.clone();

        // The starting caller's token already drives the task, and the shared
        // result only resolves after the entry has been removed
        let (shared, joined) = {
            let mut table = self.inner.lock_in_flight();
            if let Some(existing) = table.get(&key).cloned() {
                debug!(key = %key, "Joining in-flight request");
                (existing, true)
            } else {
                let guard = InFlightGuard {
                    inner: Arc::clone(&self.inner),
                    key: key.clone(),
                };
                let handle = tokio::spawn(async move {
                    let result = guard.inner.execute(&descriptor, &options).await;
                    drop(guard);
                    result
                });
                let response = handle
                    .map(|joined| {
                        joined.unwrap_or_else(|e| {
                            Err(ApiError::new(
                                ErrorKind::Unknown,
                                format!("Request task failed: {e}"),
                            ))
                        })
                    })
                    .boxed()
                    .shared();
                table.insert(key, response.clone());
                (response, false)
            }
        };

        if joined {
            or_cancel(waiter_cancel.as_ref(), shared).await?
        } else {
            shared.await
        }
    }

    /// Issue a GET request with the default options
    pub async fn get(
        &self,
        path: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Result<Value, ApiError> {
        self.send(RequestDescriptor::get(path, endpoint)).await
    }

    /// Number of distinct requests currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock_in_flight().len()
    }

    /// Exclusive access to the rate limiter; do not hold across an await
    pub fn rate_limiter(&self) -> MutexGuard<'_, RateLimiter> {
        self.inner.lock_rate_limiter()
    }
}

impl ClientInner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, SharedResponse>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_rate_limiter(&self) -> MutexGuard<'_, RateLimiter> {
        self.rate_limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit or deny the request, recording it when admitted
    fn admit(&self, endpoint: &str) -> Result<(), ApiError> {
        let mut limiter = self.lock_rate_limiter();
        let status = limiter.check(endpoint);
        if !status.allowed {
            let wait = status.wait_time();
            warn!(
                endpoint = endpoint,
                limit = status.limit,
                wait_ms = wait.as_millis() as u64,
                "Request denied by client-side rate limit"
            );
            return Err(ApiError::rate_limited(wait));
        }
        limiter.record(endpoint);
        Ok(())
    }

    async fn execute(
        &self,
        descriptor: &RequestDescriptor,
        options: &RequestOptions,
    ) -> Result<Value, ApiError> {
        let cancel = options.cancel.as_ref();
        let path = descriptor.path.as_str();

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            debug!(path = path, "Request cancelled before start");
            return Err(ApiError::cancelled());
        }

        if options.enable_rate_limit {
            self.admit(&descriptor.endpoint)?;
        }

        let attempts = options.retries.saturating_add(1);
        for attempt in 0..attempts {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                debug!(path = path, "Request cancelled");
                return Err(ApiError::cancelled());
            }

            debug!(
                method = %descriptor.method,
                path = path,
                attempt = attempt + 1,
                "Making API request"
            );

            let outcome = or_cancel(cancel, self.transport.send(descriptor)).await?;
            let error = match outcome.and_then(|body| ResponseBody::decode(body).into_data()) {
                Ok(data) => {
                    debug!(path = path, "Request successful");
                    return Ok(data);
                }
                Err(raw) => normalize(raw),
            };

            let is_last = attempt + 1 == attempts;
            if is_last || !error.is_retryable() {
                warn!(
                    path = path,
                    kind = %error.kind,
                    status = ?error.status,
                    attempts = attempt + 1,
                    error = %error,
                    "Request failed"
                );
                return Err(error);
            }

            let delay = options.backoff(attempt);
            warn!(
                path = path,
                kind = %error.kind,
                delay_ms = delay.as_millis() as u64,
                "Request failed, retrying after delay"
            );
            or_cancel(cancel, sleep(delay)).await?;
        }

        Err(ApiError::new(
            ErrorKind::Unknown,
            "Request failed after all retries",
        ))
    }
}
