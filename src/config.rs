//! Configuration management for the bridge.
//!
//! Configuration is loaded from, in increasing order of precedence:
//! 1. Built-in defaults
//! 2. A TOML file given with `--config`
//! 3. Environment variables prefixed with `BUSBRIDGE_` (nested keys use
//!    `__`, e.g. `BUSBRIDGE_LOG__LEVEL`)
//! 4. Command-line arguments

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::bus::BusClass;
use crate::error::{BridgeError, Result};

/// Command-line arguments
#[derive(Debug, Default, Parser)]
#[clap(version, about = "Bridge JSON requests and events to the message bus")]
pub struct Args {
    /// Configuration file path
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Bus used by requests that do not name one (user or system)
    #[clap(long)]
    pub bus: Option<BusClass>,

    /// Maximum number of requests waiting for the dispatch thread
    #[clap(long)]
    pub queue_capacity: Option<usize>,

    /// Event used by subscriptions that do not name one
    #[clap(long)]
    pub default_event: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log filter directives, overriding the configured level
    #[clap(long)]
    pub log_filter: Option<String>,
}

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub default_bus: BusClass,
    #[serde(default = "default_event_name")]
    pub default_event: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub log: LogConfig,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Full `EnvFilter` directives; wins over `level` when set
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: None,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_bus: BusClass::default(),
            default_event: default_event_name(),
            queue_capacity: default_queue_capacity(),
            log: LogConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("default_bus", BusClass::default().as_str())?
            .set_default("default_event", default_event_name())?
            .set_default("queue_capacity", default_queue_capacity() as i64)?;

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("BUSBRIDGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: BridgeConfig = builder.build()?.try_deserialize()?;

        // Override with command line args
        if let Some(bus) = args.bus {
            config.default_bus = bus;
        }
        if let Some(capacity) = args.queue_capacity {
            config.queue_capacity = capacity;
        }
        if let Some(event) = &args.default_event {
            config.default_event = event.clone();
        }
        if let Some(filter) = &args.log_filter {
            config.log.filter = Some(filter.clone());
        }
        match args.verbose {
            0 => {}
            1 => config.log.level = "debug".into(),
            _ => config.log.level = "trace".into(),
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(BridgeError::Config("queue_capacity must be at least 1".into()));
        }
        if self.default_event.is_empty() {
            return Err(BridgeError::Config("default_event must not be empty".into()));
        }
        Ok(())
    }

    /// Directives for the tracing `EnvFilter`
    pub fn log_directives(&self) -> &str {
        self.log.filter.as_deref().unwrap_or(&self.log.level)
    }
}

fn default_event_name() -> String {
    "default".to_string()
}

fn default_queue_capacity() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}
