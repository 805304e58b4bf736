//! HTTP access layer for the comic API.
//!
//! This module provides a deduplicating, rate-limited, retry-enabled client
//! and the error normalization every caller relies on.

pub mod cancel;
pub mod client;
pub mod error;
pub mod rate_limiter;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cancel::CancellationToken;
pub use client::{HttpClient, RequestOptions};
pub use error::{classify, extract_message, normalize, ApiError, ErrorKind, RawError};
pub use rate_limiter::{RateLimitStatus, RateLimiter};
pub use transport::{ReqwestTransport, Transport};
pub use types::{Envelope, Method, RequestDescriptor, ResponseBody};
