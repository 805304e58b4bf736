//! Error classification and normalization.
//!
//! Every failure leaving the client is an [`ApiError`]: a fixed [`ErrorKind`]
//! plus a message ready for display. Raw failures arrive as a structured
//! [`RawError`] and are classified by status code and cause first; matching on
//! message text is only used for inputs that carry nothing else.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Fixed taxonomy of client-visible failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Timeout,
    Validation,
    NotFound,
    RateLimit,
    ServerError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Whether the retry loop may try again after this kind of failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::ServerError | ErrorKind::RateLimit
        )
    }

    fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::Network => "Unable to reach the server. Check your internet connection.",
            ErrorKind::Timeout => "The request timed out. Please try again.",
            ErrorKind::Validation => "The request contains invalid parameters.",
            ErrorKind::NotFound => "The requested content could not be found.",
            ErrorKind::RateLimit => "Too many requests. Please wait a moment and try again.",
            ErrorKind::ServerError => "The server encountered an error. Please try again later.",
            ErrorKind::Unknown => GENERIC_MESSAGE,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const GENERIC_MESSAGE: &str = "An unexpected error occurred. Please try again.";
const CANCELLED_MESSAGE: &str = "The request was cancelled.";

/// A failure as observed at the transport or envelope layer
#[derive(Debug, Error)]
pub enum RawError {
    /// No response was received
    #[error("transport error: {message}")]
    Transport { message: String, timeout: bool },

    /// The server answered with a non-success status
    #[error("HTTP {status}")]
    Status {
        status: u16,
        message: Option<String>,
        retry_after: Option<Duration>,
    },

    /// The response envelope reported a failure
    #[error("{0}")]
    Envelope(String),

    /// The body could not be decoded as JSON
    #[error("invalid response body: {0}")]
    Decode(String),

    /// Unstructured failure carrying only a message
    #[error("{0}")]
    Message(String),

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Normalized(ApiError),
}

/// The error type surfaced to every caller of the client
#[derive(Debug, Clone, Error, Serialize)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    /// Human-readable text suitable for direct display
    pub message: String,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
    #[serde(skip)]
    cancelled: bool,
    #[serde(skip)]
    cause: Option<Arc<RawError>>,
}

impl PartialEq for ApiError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.message == other.message
            && self.status == other.status
            && self.retry_after == other.retry_after
            && self.cancelled == other.cancelled
    }
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
            cancelled: false,
            cause: None,
        }
    }

    /// Caller-supplied parameters were rejected before any network call
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// The client-side rate limiter denied the request
    pub fn rate_limited(retry_after: Duration) -> Self {
        let seconds = retry_after.as_secs_f64().ceil().max(1.0) as u64;
        Self {
            retry_after: Some(retry_after),
            ..Self::new(
                ErrorKind::RateLimit,
                format!("Too many requests. Please wait {seconds}s and try again."),
            )
        }
    }

    pub fn cancelled() -> Self {
        normalize(RawError::Cancelled)
    }

    pub fn is_retryable(&self) -> bool {
        !self.cancelled && self.kind.is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Text suitable for showing to an end user
    pub fn user_message(&self) -> &str {
        if self.message.trim().is_empty() {
            self.kind.default_message()
        } else {
            &self.message
        }
    }

    /// The raw failure this error was normalized from, if any
    pub fn cause(&self) -> Option<&RawError> {
        self.cause.as_deref()
    }
}

impl From<RawError> for ApiError {
    fn from(raw: RawError) -> Self {
        normalize(raw)
    }
}

static TIMEOUT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\btimed?[\s_-]?out\b").expect("valid timeout regex"));

static VALIDATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\brequired\b|\binvalid\b|\bmust be\b|\bat least\b|\btoo (short|long)\b)")
        .expect("valid validation regex")
});

static NOT_FOUND_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)not\s+found").expect("valid not-found regex"));

fn kind_for_status(status: u16) -> Option<ErrorKind> {
    match status {
        404 => Some(ErrorKind::NotFound),
        429 => Some(ErrorKind::RateLimit),
        400 => Some(ErrorKind::Validation),
        s if s >= 500 => Some(ErrorKind::ServerError),
        _ => None,
    }
}

/// Last resort for inputs that carry nothing but text
fn classify_message(message: &str) -> ErrorKind {
    if VALIDATION_PATTERN.is_match(message) {
        ErrorKind::Validation
    } else if NOT_FOUND_PATTERN.is_match(message) {
        ErrorKind::NotFound
    } else {
        ErrorKind::Unknown
    }
}

fn status_message(status: u16) -> Option<&'static str> {
    let message = match status {
        400 => "The request was invalid. Please check your input.",
        401 => "You are not authorized to access this content.",
        403 => "Access to this content is forbidden.",
        404 => "The requested content could not be found.",
        408 => "The server took too long to respond. Please try again.",
        429 => "Too many requests. Please wait a moment and try again.",
        500 => "The server encountered an error. Please try again later.",
        502 => "The server is temporarily unreachable. Please try again later.",
        503 => "The service is temporarily unavailable. Please try again later.",
        504 => "The server timed out. Please try again later.",
        _ => return None,
    };
    Some(message)
}

/// Map a raw failure to its kind
pub fn classify(raw: &RawError) -> ErrorKind {
    match raw {
        RawError::Normalized(e) => e.kind,
        RawError::Transport { message, timeout } => {
            if *timeout || TIMEOUT_PATTERN.is_match(message) {
                ErrorKind::Timeout
            } else {
                ErrorKind::Network
            }
        }
        RawError::Status {
            status, message, ..
        } => kind_for_status(*status).unwrap_or_else(|| {
            message
                .as_deref()
                .map(classify_message)
                .unwrap_or(ErrorKind::Unknown)
        }),
        RawError::Envelope(message) | RawError::Message(message) => classify_message(message),
        RawError::Decode(_) | RawError::Cancelled => ErrorKind::Unknown,
    }
}

/// Pick the text shown to the user
///
/// A message supplied by the server wins, then a status template, then a
/// template for the kind.
pub fn extract_message(raw: &RawError) -> String {
    let explicit = match raw {
        RawError::Normalized(e) => return e.message.clone(),
        RawError::Cancelled => return CANCELLED_MESSAGE.to_string(),
        RawError::Status { message, .. } => message.as_deref(),
        RawError::Envelope(message) | RawError::Message(message) => Some(message.as_str()),
        RawError::Transport { .. } | RawError::Decode(_) => None,
    };

    if let Some(message) = explicit.map(str::trim).filter(|m| !m.is_empty()) {
        return message.to_string();
    }

    if let RawError::Status { status, .. } = raw {
        if let Some(template) = status_message(*status) {
            return template.to_string();
        }
    }

    classify(raw).default_message().to_string()
}

/// Turn any raw failure into an [`ApiError`]
///
/// Already-normalized errors pass through unchanged.
pub fn normalize(raw: RawError) -> ApiError {
    if let RawError::Normalized(e) = raw {
        return e;
    }

    let kind = classify(&raw);
    let message = extract_message(&raw);
    let (status, retry_after) = match &raw {
        RawError::Status {
            status,
            retry_after,
            ..
        } => (Some(*status), *retry_after),
        _ => (None, None),
    };
    let cancelled = matches!(raw, RawError::Cancelled);

    ApiError {
        kind,
        message,
        status,
        retry_after,
        cancelled,
        cause: Some(Arc::new(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16) -> RawError {
        RawError::Status {
            status,
            message: None,
            retry_after: None,
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify(&status(404)), ErrorKind::NotFound);
        assert_eq!(classify(&status(429)), ErrorKind::RateLimit);
        assert_eq!(classify(&status(400)), ErrorKind::Validation);
        assert_eq!(classify(&status(500)), ErrorKind::ServerError);
        assert_eq!(classify(&status(503)), ErrorKind::ServerError);
        assert_eq!(classify(&status(418)), ErrorKind::Unknown);
    }

    #[test]
    fn test_transport_classification() {
        let network = RawError::Transport {
            message: "connection refused".to_string(),
            timeout: false,
        };
        assert_eq!(classify(&network), ErrorKind::Network);

        let flagged = RawError::Transport {
            message: "error sending request".to_string(),
            timeout: true,
        };
        assert_eq!(classify(&flagged), ErrorKind::Timeout);

        let mentioned = RawError::Transport {
            message: "operation timed out".to_string(),
            timeout: false,
        };
        assert_eq!(classify(&mentioned), ErrorKind::Timeout);
    }

    #[test]
    fn test_message_fallback_classification() {
        let raw = RawError::Message("Parameter keyword is required".to_string());
        assert_eq!(classify(&raw), ErrorKind::Validation);

        let raw = RawError::Envelope("Komik not found".to_string());
        assert_eq!(classify(&raw), ErrorKind::NotFound);

        let raw = RawError::Message("something odd happened".to_string());
        assert_eq!(classify(&raw), ErrorKind::Unknown);

        // A status the table does not cover falls back to the server's text
        let raw = RawError::Status {
            status: 422,
            message: Some("page must be a positive integer".to_string()),
            retry_after: None,
        };
        assert_eq!(classify(&raw), ErrorKind::Validation);
    }

    #[test]
    fn test_message_extraction_precedence() {
        let raw = RawError::Status {
            status: 404,
            message: Some("Chapter does not exist".to_string()),
            retry_after: None,
        };
        assert_eq!(extract_message(&raw), "Chapter does not exist");

        assert_eq!(
            extract_message(&status(404)),
            "The requested content could not be found."
        );

        assert_eq!(extract_message(&status(418)), GENERIC_MESSAGE);

        let raw = RawError::Transport {
            message: "dns error".to_string(),
            timeout: false,
        };
        assert_eq!(
            extract_message(&raw),
            ErrorKind::Network.default_message()
        );
    }

    #[test]
    fn test_normalize_keeps_status_and_retry_after() {
        let err = normalize(RawError::Status {
            status: 429,
            message: None,
            retry_after: Some(Duration::from_secs(3)),
        });
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.status, Some(429));
        assert_eq!(err.retry_after, Some(Duration::from_secs(3)));
        assert!(err.is_retryable());
        assert!(matches!(err.cause(), Some(RawError::Status { status: 429, .. })));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize(status(502));
        let twice = normalize(RawError::Normalized(once.clone()));
        assert_eq!(once, twice);

        let validation = ApiError::validation("Keyword must be at least 2 characters");
        assert_eq!(normalize(RawError::Normalized(validation.clone())), validation);
    }

    #[test]
    fn test_cancelled_error() {
        let err = ApiError::cancelled();
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
        assert_eq!(err.message, CANCELLED_MESSAGE);
    }

    #[test]
    fn test_rate_limited_error() {
        let err = ApiError::rate_limited(Duration::from_millis(1500));
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.retry_after, Some(Duration::from_millis(1500)));
        assert!(err.message.contains("2s"));
    }

    #[test]
    fn test_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::ServerError).unwrap();
        assert_eq!(json, "\"SERVER_ERROR\"");
    }

    #[test]
    fn test_user_message() {
        let err = normalize(status(503));
        assert_eq!(
            err.user_message(),
            "The service is temporarily unavailable. Please try again later."
        );

        let blank = ApiError::new(ErrorKind::Timeout, "  ");
        assert_eq!(blank.user_message(), ErrorKind::Timeout.default_message());

        let limited = ApiError::rate_limited(Duration::from_millis(1500));
        assert!(limited.user_message().contains("wait 2s"));
    }
}
