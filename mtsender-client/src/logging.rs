//! Logging setup.
//!
//! Everything logs through the `log` facade. [`init`] installs `env_logger`
//! once per process when asked to; by default the application's own logger
//! receives the records. [`Logger`] is the per-connection handle that tags lines
//! with the datacenter and applies the connection's own level.

use std::fmt;
use std::sync::Once;

use log::{Level, LevelFilter};

static INIT: Once = Once::new();

/// Logging options carried in [`crate::Config`].
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Default level for this crate's connections.
    pub level:     LevelFilter,
    /// Extra `env_logger` directives (`"mtsender_client=debug,tokio=warn"`);
    /// `RUST_LOG` is used when this is `None`.
    pub filters:   Option<String>,
    /// Whether [`init`] should install `env_logger`. Off by default: a
    /// library leaves the choice of logger to the application.
    pub install:   bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: LevelFilter::Info, filters: None, install: false }
    }
}

/// Install `env_logger` according to `config`. Only the first call has any
/// effect; an already installed logger is left in place.
pub fn init(config: &LogConfig) {
    if !config.install {
        return;
    }
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(config.level);
        match &config.filters {
            Some(f) => { builder.parse_filters(f); }
            None => {
                if let Ok(f) = std::env::var("RUST_LOG") {
                    builder.parse_filters(&f);
                }
            }
        }
        if builder.try_init().is_err() {
            log::debug!("[logging] a logger was already installed");
        }
    });
}

/// Per-connection log handle: a level plus a `[dcN]` tag.
#[derive(Clone, Debug)]
pub struct Logger {
    level: LevelFilter,
    tag:   String,
}

impl Logger {
    pub fn new(level: LevelFilter, dc_id: i32) -> Self {
        Self { level, tag: format!("[dc{dc_id}]") }
    }

    pub fn tag(&self) -> &str { &self.tag }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            log::log!(level, "{} {}", self.tag, args);
        }
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) { self.log(Level::Debug, args) }
    pub fn info(&self, args: fmt::Arguments<'_>)  { self.log(Level::Info, args) }
    pub fn warn(&self, args: fmt::Arguments<'_>)  { self.log(Level::Warn, args) }
    pub fn error(&self, args: fmt::Arguments<'_>) { self.log(Level::Error, args) }
}
