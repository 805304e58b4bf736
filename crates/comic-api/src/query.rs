//! Cache-aware data fetching for UI-style consumers.
//!
//! A [`Query`] checks the cache, otherwise calls the [`ComicApi`], and tracks
//! `data`, `loading` and `error` in a [`QueryState`] that can be observed
//! through a watch channel. [`Query::refetch`] drops the cached entry and goes
//! to the network.

use crate::api::ApiError;
use crate::cache::CacheManager;
use crate::facade::ComicApi;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// A logical API operation with its parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    Recommended,
    Popular,
    Latest { page: u32 },
    Detail { id: String },
    Search { keyword: String },
    Chapter { id: String },
    Genres,
    ByGenre { genre: String, page: u32 },
}

impl Operation {
    /// Cache key used when the caller does not supply one
    pub fn cache_key(&self) -> String {
        match self {
            Operation::Recommended => "recommended".to_string(),
            Operation::Popular => "popular".to_string(),
            Operation::Latest { page } => format!("latest_{page}"),
            Operation::Detail { id } => format!("detail_{}", id.trim()),
            Operation::Search { keyword } => format!("search_{}", keyword.trim().to_lowercase()),
            Operation::Chapter { id } => format!("chapter_{}", id.trim()),
            Operation::Genres => "genres".to_string(),
            Operation::ByGenre { genre, page } => format!("genre_{}_{page}", genre.trim()),
        }
    }

    /// How long results of this operation stay fresh
    pub fn default_ttl(&self) -> Duration {
        const MINUTE: u64 = 60;
        let secs = match self {
            Operation::Latest { .. } | Operation::Search { .. } => 5 * MINUTE,
            Operation::Recommended | Operation::Popular => 15 * MINUTE,
            Operation::Detail { .. } | Operation::ByGenre { .. } => 30 * MINUTE,
            Operation::Chapter { .. } => 60 * MINUTE,
            Operation::Genres => 24 * 60 * MINUTE,
        };
        Duration::from_secs(secs)
    }

    async fn run(&self, api: &ComicApi) -> Result<Value, ApiError> {
        match self {
            Operation::Recommended => api.recommended().await,
            Operation::Popular => api.popular().await,
            Operation::Latest { page } => api.latest(*page).await,
            Operation::Detail { id } => api.detail(id).await,
            Operation::Search { keyword } => api.search(keyword).await,
            Operation::Chapter { id } => api.read_chapter(id).await,
            Operation::Genres => api.genres().await,
            Operation::ByGenre { genre, page } => api.by_genre(genre, *page).await,
        }
    }
}

/// Per-query caching behaviour
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Overrides [`Operation::cache_key`]
    pub cache_key: Option<String>,
    /// Overrides [`Operation::default_ttl`]
    pub cache_ttl: Option<Duration>,
    pub enable_cache: bool,
    /// Do not fetch at all
    pub skip: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            cache_key: None,
            cache_ttl: None,
            enable_cache: true,
            skip: false,
        }
    }
}

/// Observable state of a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    pub data: Option<Value>,
    pub loading: bool,
    pub error: Option<ApiError>,
}

/// Creates queries sharing one API client and cache
#[derive(Clone)]
pub struct QueryClient {
    api: ComicApi,
    cache: Arc<CacheManager>,
}

impl QueryClient {
    pub fn new(api: ComicApi, cache: Arc<CacheManager>) -> Self {
        Self { api, cache }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Build a query without running it
    pub fn query(&self, operation: Operation, options: QueryOptions) -> Query {
        let (state, _) = watch::channel(QueryState::default());
        Query {
            client: self.clone(),
            operation,
            options,
            state,
        }
    }

    /// Build a query and run it unless `skip` is set
    pub async fn fetch(&self, operation: Operation, options: QueryOptions) -> Query {
        let mut query = self.query(operation, options);
        query.run().await;
        query
    }
}

/// One operation bound to its cache key and state
pub struct Query {
    client: QueryClient,
    operation: Operation,
    options: QueryOptions,
    state: watch::Sender<QueryState>,
}

impl Query {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn cache_key(&self) -> String {
        self.options
            .cache_key
            .clone()
            .unwrap_or_else(|| self.operation.cache_key())
    }

    fn ttl(&self) -> Duration {
        self.options
            .cache_ttl
            .unwrap_or_else(|| self.operation.default_ttl())
    }

    /// Snapshot of the current state
    pub fn state(&self) -> QueryState {
        self.state.borrow().clone()
    }

    /// Receive every state change
    pub fn subscribe(&self) -> watch::Receiver<QueryState> {
        self.state.subscribe()
    }

    /// Load data, serving from the cache when possible
    pub async fn run(&mut self) -> QueryState {
        if self.options.skip {
            debug!(operation = ?self.operation, "Query skipped");
            return self.state();
        }
        self.load(false).await
    }

    /// Invalidate the cached entry and load from the network
    pub async fn refetch(&mut self) -> QueryState {
        if self.options.enable_cache {
            self.client.cache.remove(&self.cache_key());
        }
        self.load(true).await
    }

    async fn load(&mut self, bypass_cache: bool) -> QueryState {
        let key = self.cache_key();

        if self.options.enable_cache && !bypass_cache {
            if let Some(data) = self.client.cache.get(&key) {
                debug!(key = %key, "Query served from cache");
                self.state.send_replace(QueryState {
                    data: Some(data),
                    loading: false,
                    error: None,
                });
                return self.state();
            }
        }

        self.state.send_modify(|state| {
            state.loading = true;
            state.error = None;
        });

        let result = self.operation.run(&self.client.api).await;

        if let Ok(data) = &result {
            if self.options.enable_cache {
                self.client.cache.set(&key, data, self.ttl());
            }
        }

        self.state.send_modify(|state| {
            state.loading = false;
            match result {
                Ok(data) => state.data = Some(data),
                Err(e) => state.error = Some(e),
            }
        });

        self.state()
    }
}
