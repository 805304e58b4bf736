//! Comic API command-line client.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comic_api::{CacheManager, ComicApi, HttpClient, Operation, QueryClient, QueryOptions};
use shared::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Skip the cache and always hit the network
    #[arg(long)]
    no_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recommended comics
    Recommended,
    /// Popular comics
    Popular,
    /// Latest updates
    Latest {
        #[arg(short, long, default_value_t = 1)]
        page: u32,
    },
    /// Comic details
    Detail { id: String },
    /// Search comics by keyword
    Search { keyword: String },
    /// Pages of a chapter
    Chapter { id: String },
    /// All genres
    Genres,
    /// Comics in a genre
    Genre {
        genre: String,
        #[arg(short, long, default_value_t = 1)]
        page: u32,
    },
    /// Show cache statistics
    CacheStats,
    /// Remove every cached entry
    ClearCache,
}

impl Command {
    fn operation(&self) -> Option<Operation> {
        let op = match self {
            Command::Recommended => Operation::Recommended,
            Command::Popular => Operation::Popular,
            Command::Latest { page } => Operation::Latest { page: *page },
            Command::Detail { id } => Operation::Detail { id: id.clone() },
            Command::Search { keyword } => Operation::Search {
                keyword: keyword.clone(),
            },
            Command::Chapter { id } => Operation::Chapter { id: id.clone() },
            Command::Genres => Operation::Genres,
            Command::Genre { genre, page } => Operation::ByGenre {
                genre: genre.clone(),
                page: *page,
            },
            Command::CacheStats | Command::ClearCache => return None,
        };
        Some(op)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    shared::logging::init(shared::LogConfig::from_config(
        &config,
        "comic-api",
        args.verbose,
    ))?;

    if !args.config.exists() {
        warn!(config_file = %args.config.display(), "Config file not found, using defaults");
    }
    info!(base_url = %config.api.base_url, "Comic API client starting");

    let cache = Arc::new(CacheManager::open(&config).context("Failed to initialize cache")?);
    cache.init();

    let http = HttpClient::from_config(&config).context("Failed to create HTTP client")?;
    let client = QueryClient::new(ComicApi::new(http), cache.clone());

    let output = match args.command.operation() {
        Some(operation) => {
            let options = QueryOptions {
                enable_cache: !args.no_cache,
                ..Default::default()
            };
            let query = client.fetch(operation, options).await;
            let state = query.state();
            if let Some(error) = state.error {
                cache.dispose();
                anyhow::bail!("{} ({})", error.user_message(), error.kind);
            }
            state.data.unwrap_or_default()
        }
        None => {
            if matches!(args.command, Command::ClearCache) {
                info!("Clearing cache");
                cache.clear();
            }
            serde_json::to_value(cache.stats()).context("Failed to serialize cache stats")?
        }
    };

    cache.dispose();

    let rendered = serde_json::to_string_pretty(&output).context("Failed to render output")?;
    println!("{rendered}");

    Ok(())
}
