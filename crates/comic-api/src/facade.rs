//! Typed entry points for each comic API operation.
//!
//! Every method validates its parameters before touching the network and
//! hands the request to [`HttpClient`] with deduplication enabled. Caching is
//! left to the caller (see [`crate::query`]).

use crate::api::{ApiError, HttpClient, RequestDescriptor, RequestOptions};
use once_cell::sync::Lazy;
use reqwest::Url;
use serde_json::Value;
use tracing::info;

/// Shortest keyword accepted by search
pub const MIN_KEYWORD_LEN: usize = 2;
/// Longest keyword accepted by search
pub const MAX_KEYWORD_LEN: usize = 100;
/// Highest page number accepted by paginated listings
pub const MAX_PAGE: u32 = 500;

/// Comic API client
#[derive(Clone)]
pub struct ComicApi {
    http: HttpClient,
}

fn validate_id<'a>(what: &str, id: &'a str) -> Result<&'a str, ApiError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ApiError::validation(format!("{what} is required")));
    }
    if id.contains('/') || id == "." || id == ".." {
        return Err(ApiError::validation(format!("{what} is invalid")));
    }
    Ok(id)
}

fn validate_page(page: u32) -> Result<u32, ApiError> {
    if page == 0 || page > MAX_PAGE {
        return Err(ApiError::validation(format!(
            "Page must be between 1 and {MAX_PAGE}"
        )));
    }
    Ok(page)
}

fn validate_keyword(keyword: &str) -> Result<&str, ApiError> {
    let keyword = keyword.trim();
    if keyword.is_empty() {
        return Err(ApiError::validation("Search keyword is required"));
    }
    let len = keyword.chars().count();
    if len < MIN_KEYWORD_LEN {
        return Err(ApiError::validation(format!(
            "Search keyword must be at least {MIN_KEYWORD_LEN} characters"
        )));
    }
    if len > MAX_KEYWORD_LEN {
        return Err(ApiError::validation(format!(
            "Search keyword must be at most {MAX_KEYWORD_LEN} characters"
        )));
    }
    Ok(keyword)
}

static SEGMENT_BASE: Lazy<Url> =
    Lazy::new(|| Url::parse("http://localhost/").expect("valid segment base URL"));

/// Percent-encode a single path segment
fn encode_segment(segment: &str) -> String {
    let mut url = SEGMENT_BASE.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.clear().push(segment);
    }
    url.path().trim_start_matches('/').to_string()
}

impl ComicApi {
    /// Create a new API facade over an HTTP client
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    async fn call(&self, descriptor: RequestDescriptor) -> Result<Value, ApiError> {
        let options = RequestOptions {
            enable_deduplication: true,
            ..self.http.defaults().clone()
        };
        self.http.request(descriptor, options).await
    }

    /// Fetch recommended comics
    pub async fn recommended(&self) -> Result<Value, ApiError> {
        info!("Fetching recommended comics");
        self.call(RequestDescriptor::get("/recommended", "recommended"))
            .await
    }

    /// Fetch popular comics
    pub async fn popular(&self) -> Result<Value, ApiError> {
        info!("Fetching popular comics");
        self.call(RequestDescriptor::get("/popular", "popular")).await
    }

    /// Fetch latest updates (paginated)
    pub async fn latest(&self, page: u32) -> Result<Value, ApiError> {
        let page = validate_page(page)?;
        info!(page = page, "Fetching latest comics");
        self.call(RequestDescriptor::get("/terbaru", "terbaru").with_param("page", page))
            .await
    }

    /// Fetch full comic details by identifier
    pub async fn detail(&self, id: &str) -> Result<Value, ApiError> {
        let id = validate_id("Comic id", id)?;
        info!(id = id, "Fetching comic details");
        self.call(RequestDescriptor::get(
            format!("/detail/{}", encode_segment(id)),
            "detail",
        ))
        .await
    }

    /// Search comics by keyword
    pub async fn search(&self, keyword: &str) -> Result<Value, ApiError> {
        let keyword = validate_keyword(keyword)?;
        info!(keyword = keyword, "Searching comics");
        self.call(RequestDescriptor::get("/search", "search").with_param("keyword", keyword))
            .await
    }

    /// Fetch the pages of a chapter
    pub async fn read_chapter(&self, id: &str) -> Result<Value, ApiError> {
        let id = validate_id("Chapter id", id)?;
        info!(id = id, "Fetching chapter");
        self.call(RequestDescriptor::get(
            format!("/read/{}", encode_segment(id)),
            "read",
        ))
        .await
    }

    /// Fetch all genres
    pub async fn genres(&self) -> Result<Value, ApiError> {
        info!("Fetching genres");
        self.call(RequestDescriptor::get("/genre", "genre")).await
    }

    /// Fetch comics for a genre (paginated)
    pub async fn by_genre(&self, genre: &str, page: u32) -> Result<Value, ApiError> {
        let genre = validate_id("Genre", genre)?;
        let page = validate_page(page)?;
        info!(genre = genre, page = page, "Fetching comics by genre");
        self.call(
            RequestDescriptor::get(format!("/genre/{}", encode_segment(genre)), "genre")
                .with_param("page", page),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::ScriptedTransport;
    use crate::api::{ErrorKind, RateLimiter};
    use serde_json::json;
    use shared::config::RateLimitConfig;
    use std::sync::Arc;

    fn api(transport: &Arc<ScriptedTransport>) -> ComicApi {
        ComicApi::new(HttpClient::new(
            transport.clone(),
            RateLimiter::new(RateLimitConfig::default()),
            RequestOptions {
                retries: 0,
                ..Default::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_invalid_parameters_never_reach_network() {
        let transport = Arc::new(ScriptedTransport::new(json!([])));
        let api = api(&transport);

        let failures = [
            api.detail("  ").await,
            api.read_chapter("").await,
            api.search("a").await,
            api.search("   ").await,
            api.search(&"x".repeat(MAX_KEYWORD_LEN + 1)).await,
            api.latest(0).await,
            api.latest(MAX_PAGE + 1).await,
            api.by_genre("", 1).await,
            api.by_genre("action", 0).await,
            api.detail("a/b").await,
            api.read_chapter("..").await,
        ];

        for result in failures {
            let err = result.unwrap_err();
            assert_eq!(err.kind, ErrorKind::Validation, "{err}");
        }
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_paths_and_params() {
        let transport = Arc::new(ScriptedTransport::new(json!({"status": "success", "data": []})));
        let api = api(&transport);

        api.recommended().await.unwrap();
        api.popular().await.unwrap();
        api.latest(2).await.unwrap();
        api.detail("one piece").await.unwrap();
        api.search("  naruto ").await.unwrap();
        api.read_chapter("one-piece-chapter-1").await.unwrap();
        api.genres().await.unwrap();
        api.by_genre("action", 3).await.unwrap();

        let requests = transport.requests();
        let paths: Vec<&str> = requests.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/recommended",
                "/popular",
                "/terbaru",
                "/detail/one%20piece",
                "/search",
                "/read/one-piece-chapter-1",
                "/genre",
                "/genre/action",
            ]
        );

        assert_eq!(requests[2].params.get("page").map(String::as_str), Some("2"));
        assert_eq!(requests[4].params.get("keyword").map(String::as_str), Some("naruto"));
        assert_eq!(requests[4].endpoint, "search");
        assert_eq!(requests[7].params.get("page").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn test_unwraps_envelope() {
        let transport = Arc::new(ScriptedTransport::new(json!({
            "status": "success",
            "data": {"title": "Solo Leveling", "chapters": 200}
        })));
        let api = api(&transport);

        let detail = api.detail("solo-leveling").await.unwrap();
        assert_eq!(detail["title"], "Solo Leveling");
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("abc-123_x.y~"), "abc-123_x.y~");
        assert_eq!(encode_segment("a b?c"), "a%20b%3Fc");
        assert_eq!(encode_segment("50%#x"), "50%25%23x");
    }
}
