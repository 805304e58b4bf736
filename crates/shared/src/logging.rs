//! Logging setup for the comic API client.
//!
//! Console output goes to stderr so command output on stdout stays clean.
//! File output rotates daily under the configured log directory.

use crate::config::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Resolved logging settings for one process
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: PathBuf,
    /// Names the log files and the primary filter target
    pub component: String,
    pub default_level: Level,
    pub console: bool,
    pub file: bool,
    /// JSON lines in the log file instead of plain text
    pub json_format: bool,
}

impl LogConfig {
    /// Settings from the `[logging]` section; `verbose` forces DEBUG
    pub fn from_config(config: &Config, component: &str, verbose: bool) -> Self {
        let default_level = if verbose {
            Level::DEBUG
        } else {
            parse_level(&config.logging.default_level)
        };

        Self {
            log_dir: config.log_dir(),
            component: component.to_string(),
            default_level,
            console: config.logging.console,
            file: config.logging.file,
            json_format: config.logging.json_format,
        }
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init(config: LogConfig) -> Result<()> {
    if config.file {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory: {}", config.log_dir.display())
        })?;
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config)));

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.console {
        layers.push(console_layer());
    }
    if config.file {
        layers.push(file_layer(&config.log_dir, &config.component, config.json_format));
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    tracing::info!(
        component = %config.component,
        log_dir = %config.log_dir.display(),
        "Logging initialized"
    );

    Ok(())
}

fn console_layer() -> BoxedLayer {
    fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_span_events(FmtSpan::NONE)
        .with_writer(std::io::stderr)
        .boxed()
}

fn file_layer(log_dir: &Path, component: &str, json: bool) -> BoxedLayer {
    let appender = tracing_appender::rolling::daily(log_dir, component);

    if json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(appender)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(appender)
            .boxed()
    }
}

/// Filter used when `RUST_LOG` is not set
fn default_directives(config: &LogConfig) -> String {
    let level = config.default_level;
    format!(
        "{}={level},shared={level},comic_api={level},hyper=warn,reqwest=warn,h2=warn",
        config.component.replace('-', "_"),
    )
}

/// Parse a level name from configuration, falling back to INFO
pub fn parse_level(level: &str) -> Level {
    level.parse().unwrap_or(Level::INFO)
}
