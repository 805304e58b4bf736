//! Client-side data access layer for the comic API.
//!
//! This library wraps the remote REST API with request deduplication,
//! client-side rate limiting, retries with exponential backoff, error
//! normalization and a two-tier (memory + persistent) cache.

pub mod api;
pub mod cache;
pub mod facade;
pub mod query;

pub use api::{ApiError, CancellationToken, ErrorKind, HttpClient, RateLimiter, RequestOptions};
pub use cache::{CacheManager, CacheStats};
pub use facade::ComicApi;
pub use query::{Operation, Query, QueryClient, QueryOptions, QueryState};
