//! Diagnostic logging
//!
//! Built from the `[logging]` settings section; the CLI layers `--verbose`
//! and the watcher's needs on top. Logs always go to stderr so stdout stays
//! free for command output.

use crate::settings::LoggingSettings;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log line layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, for a person at a terminal
    Pretty,
    /// One line per event
    #[default]
    Compact,
}

/// Resolved subscriber options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    pub filter: String,
    /// Line layout
    pub format: LogFormat,
    /// Print source file and line
    pub source_locations: bool,
    /// Print the emitting thread (useful with the ingest worker pool)
    pub thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from_settings(&LoggingSettings::default())
    }
}

impl LogConfig {
    /// Options as configured in `[logging]`
    pub fn from_settings(settings: &LoggingSettings) -> Self {
        Self {
            filter: settings.level.clone(),
            format: settings.format,
            source_locations: settings.source_locations,
            thread_ids: false,
        }
    }

    /// `--verbose`: debug everywhere, with source locations
    pub fn verbose(mut self) -> Self {
        self.filter = "debug".to_string();
        self.source_locations = true;
        self
    }

    /// Long-running inbox watcher: tag lines with their thread
    pub fn watching(mut self) -> Self {
        self.thread_ids = true;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.filter))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber. Only the first call takes effect.
pub fn init_logging(config: &LogConfig) {
    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(config.source_locations)
        .with_line_number(config.source_locations)
        .with_thread_ids(config.thread_ids);
    let registry = tracing_subscriber::registry().with(config.env_filter());

    let installed = match config.format {
        LogFormat::Pretty => registry.with(base.pretty()).try_init(),
        LogFormat::Compact => registry.with(base.compact()).try_init(),
    };

    if installed.is_ok() {
        tracing::debug!(filter = %config.filter, format = ?config.format, "logging ready");
    }
}
