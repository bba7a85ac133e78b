//! Configuration for the client and server binaries.
//!
//! Pool sizes, queue bounds, and timeouts come from an optional TOML file;
//! anything not set falls back to defaults. The binaries layer their own CLI
//! flags (log level, config path) on top, with CLI taking precedence.

use crate::dispatcher::OverflowPolicy;
use crate::error::Error;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub batch: BatchSection,
    #[serde(default)]
    pub io: IoSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-side settings.
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Number of I/O worker threads (each with its own poll and listener).
    #[serde(default = "default_io_workers")]
    pub io_workers: usize,
    /// Best-effort drain window when stopping, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            io_workers: default_io_workers(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Dispatch worker pool settings.
#[derive(Debug, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_dispatch_workers")]
    pub workers: usize,
    /// Bound on the dispatch queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// What to do when the queue is full: "block" or "drop".
    #[serde(default = "default_overflow")]
    pub overflow: OverflowPolicy,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            workers: default_dispatch_workers(),
            queue_capacity: default_queue_capacity(),
            overflow: default_overflow(),
        }
    }
}

/// Batch coordinator settings.
#[derive(Debug, Deserialize)]
pub struct BatchSection {
    /// Worker threads running sessions; may be smaller than the batch size.
    #[serde(default = "default_batch_workers")]
    pub workers: usize,
    /// Sessions per batch in client-batch mode.
    #[serde(default = "default_batch_size")]
    pub size: usize,
    /// Bound on the whole-batch wait, in milliseconds.
    #[serde(default = "default_batch_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            workers: default_batch_workers(),
            size: default_batch_size(),
            timeout_ms: default_batch_timeout_ms(),
        }
    }
}

/// Transport settings shared by both sides.
#[derive(Debug, Deserialize)]
pub struct IoSection {
    /// Read buffer size; also the largest payload observable as one message.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Bound on each connect/send/close wait, in milliseconds.
    #[serde(default = "default_io_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for IoSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            timeout_ms: default_io_timeout_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_io_workers() -> usize {
    1
}

fn default_shutdown_grace_ms() -> u64 {
    500
}

fn default_dispatch_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_overflow() -> OverflowPolicy {
    OverflowPolicy::Block
}

fn default_batch_workers() -> usize {
    2
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    60_000
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_io_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub io_workers: usize,
    pub shutdown_grace: Duration,
    pub dispatch_workers: usize,
    pub dispatch_queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub batch_workers: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub buffer_size: usize,
    pub io_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load from an optional TOML file; absent values use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let toml_config = if let Some(path) = path {
            let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
                path: path.to_path_buf(),
                source: e,
            })?;
            toml::from_str(&contents).map_err(|e| Error::ConfigParse {
                path: path.to_path_buf(),
                source: e,
            })?
        } else {
            TomlConfig::default()
        };
        Ok(Self::from_toml(toml_config))
    }

    fn from_toml(toml_config: TomlConfig) -> Self {
        Config {
            io_workers: toml_config.server.io_workers.max(1),
            shutdown_grace: Duration::from_millis(toml_config.server.shutdown_grace_ms),
            dispatch_workers: toml_config.dispatcher.workers.max(1),
            dispatch_queue_capacity: toml_config.dispatcher.queue_capacity.max(1),
            overflow: toml_config.dispatcher.overflow,
            batch_workers: toml_config.batch.workers.max(1),
            batch_size: toml_config.batch.size,
            batch_timeout: Duration::from_millis(toml_config.batch.timeout_ms),
            buffer_size: toml_config.io.buffer_size.max(1),
            io_timeout: Duration::from_millis(toml_config.io.timeout_ms),
            log_level: toml_config.logging.level,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default())
    }
}
