//! Process configuration.
//!
//! Layered the usual way: built-in defaults, then `rook.yaml` (working
//! directory, then `~/.config/rook/rook.yaml`), then environment variables
//! with the `ROOK` prefix and `__` separator. Each outbox flavor reads its
//! own block; nothing is shared between flavors implicitly.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dsl;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RookConfig {
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub outbox: OutboxFlavors,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Directory of workflow definition documents to preload.
    pub definitions: Option<PathBuf>,

    /// Buffer size of the in-process loopback channels.
    pub channel_capacity: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            definitions: None,
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection string for the outbox tables.
    pub url: Option<String>,

    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
        }
    }
}

/// One configuration block per outbox flavor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutboxFlavors {
    #[serde(default)]
    pub wait: OutboxConfig,
    #[serde(default)]
    pub retry: OutboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Startup disable switch for this flavor's processors.
    pub enabled: bool,

    pub poll_interval_ms: u64,
    pub cleanup_interval_ms: u64,

    /// Rows claimed per transaction.
    pub batch_size: i64,

    /// Delivery attempts before a row is marked FAILED.
    pub max_attempts: i32,

    /// Base of the redelivery backoff.
    pub initial_delay_ms: u64,

    /// Consecutive empty batches that end a cycle.
    pub max_empty_batches: u32,

    /// How long SENT rows are kept, as an ISO 8601 duration.
    pub retention: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 500,
            cleanup_interval_ms: 60_000,
            batch_size: 50,
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_empty_batches: 3,
            retention: "P7D".to_string(),
        }
    }
}

impl OutboxConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn retention(&self) -> Result<Duration, dsl::DurationError> {
        dsl::parse_iso8601_duration(&self.retention)
    }
}

impl RookConfig {
    /// Load configuration with the precedence: defaults, config files,
    /// `ROOK__`-prefixed environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&RookConfig::default())?)
            .add_source(
                config::File::with_name("rook")
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::File::with_name(&format!(
                    "{}/.config/rook/rook",
                    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
                ))
                .format(config::FileFormat::Yaml)
                .required(false),
            )
            .add_source(
                config::Environment::with_prefix("ROOK")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}
