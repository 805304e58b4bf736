//! Client-side rate limiter using a sliding window per endpoint.
//!
//! Limits are looked up by substring: the first configured pattern contained in
//! the endpoint wins, otherwise the default limit applies. Checking never
//! records; callers record only once they actually proceed.

use shared::config::{LimitRule, RateLimitConfig};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub allowed: bool,
    /// Requests still available in the current window
    pub remaining: u32,
    /// When the oldest recorded request leaves the window
    pub reset_at: Instant,
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitStatus {
    /// How long a denied caller should wait before trying again
    pub fn wait_time(&self) -> Duration {
        self.reset_at.saturating_duration_since(Instant::now())
    }
}

/// Sliding-window rate limiter keyed by endpoint
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    /// Request timestamps per endpoint, oldest first
    windows: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// The limit that applies to an endpoint
    pub fn limit_for(&self, endpoint: &str) -> LimitRule {
        self.config
            .endpoints
            .iter()
            .find(|rule| endpoint.contains(rule.pattern.as_str()))
            .map(|rule| rule.limit())
            .unwrap_or(self.config.default)
    }

    /// Check whether a request to `endpoint` may proceed now
    pub fn check(&mut self, endpoint: &str) -> RateLimitStatus {
        let rule = self.limit_for(endpoint);
        let window = Duration::from_millis(rule.window_ms);
        let now = Instant::now();

        let timestamps = self.windows.entry(endpoint.to_string()).or_default();
        timestamps.retain(|&t| now.duration_since(t) < window);

        let count = timestamps.len() as u32;
        let allowed = count < rule.max_requests;
        let reset_at = timestamps.first().map_or(now, |&oldest| oldest + window);

        if !allowed {
            tracing::debug!(
                endpoint = endpoint,
                limit = rule.max_requests,
                wait_ms = reset_at.saturating_duration_since(now).as_millis() as u64,
                "Rate limit reached"
            );
        }

        RateLimitStatus {
            allowed,
            remaining: rule.max_requests.saturating_sub(count),
            reset_at,
            limit: rule.max_requests,
            window,
        }
    }

    /// Record that a request to `endpoint` was made
    pub fn record(&mut self, endpoint: &str) {
        self.windows
            .entry(endpoint.to_string())
            .or_default()
            .push(Instant::now());
    }

    /// Time until `endpoint` admits another request, if it is currently full
    pub fn wait_time(&mut self, endpoint: &str) -> Option<Duration> {
        let status = self.check(endpoint);
        (!status.allowed).then(|| status.wait_time())
    }

    /// Forget every recorded request
    pub fn reset(&mut self) {
        self.windows.clear();
    }
}
