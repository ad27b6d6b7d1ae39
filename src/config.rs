//! Crawl configuration.
//!
//! Options are loaded once at startup (TOML file plus CLI overrides applied
//! by the binary) and treated as immutable for the lifetime of the crawl.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default per-stage worker concurrency.
pub const DEFAULT_WORKERS_COUNT: usize = 10;

/// Default redirect chain limit.
pub const DEFAULT_MAX_REDIRECT: u32 = 5;

/// Default number of URLs claimed from the source per pull.
pub const DEFAULT_PULL_BATCH_SIZE: usize = 50;

/// Default capacity of the channels between stages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Configuration errors. All are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`Config`].
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A recognized option carries an unusable value.
    #[error("invalid option `{option}`: {reason}")]
    Invalid {
        /// Option name as it appears in the file.
        option: &'static str,
        /// Why it's invalid.
        reason: String,
    },
}

/// Remote coordinator (HQ) connection settings.
///
/// When present, the HQ adapter replaces the local queue as the source.
#[derive(Debug, Clone, Deserialize)]
pub struct HqSettings {
    /// Base address of the HQ API, e.g. `http://hq.example.org:8080`.
    pub address: String,
    /// Project namespace the crawl feeds from and reports to.
    pub project: String,
}

/// Options the crawler core consults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Per-stage worker concurrency.
    pub workers_count: usize,
    /// Seed depth limit: outlinks past this hop count are not re-enqueued.
    pub max_hops: u32,
    /// Redirect chain limit for seed URLs.
    pub max_redirect: u32,
    /// Skip asset extraction entirely once the hop limit is reached.
    pub disable_assets_capture: bool,
    /// Same-host outlinks discovered at hop 0 inherit the parent's hop
    /// count instead of incrementing it.
    pub domains_crawl: bool,
    /// Job directory; the local queue database lives at `{job_path}/lq.db`.
    pub job_path: PathBuf,
    /// Route outlinks to an external topic instead of the local frontier.
    pub use_kafka: bool,
    /// Topic name for outlinks when `use_kafka` is set.
    pub kafka_outlinks_topic: Option<String>,
    /// URLs claimed from the source per pull.
    pub pull_batch_size: usize,
    /// Capacity of the channels between stages.
    pub channel_capacity: usize,
    /// Remote coordinator settings; local queue is used when absent.
    pub hq: Option<HqSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers_count: DEFAULT_WORKERS_COUNT,
            max_hops: 0,
            max_redirect: DEFAULT_MAX_REDIRECT,
            disable_assets_capture: false,
            domains_crawl: false,
            job_path: PathBuf::from("."),
            use_kafka: false,
            kafka_outlinks_topic: None,
            pull_batch_size: DEFAULT_PULL_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            hq: None,
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed, or
    /// carries unusable values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates option values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first unusable option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers_count == 0 {
            return Err(ConfigError::Invalid {
                option: "workers_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pull_batch_size == 0 {
            return Err(ConfigError::Invalid {
                option: "pull_batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                option: "channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.use_kafka
            && self
                .kafka_outlinks_topic
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(ConfigError::Invalid {
                option: "kafka_outlinks_topic",
                reason: "required when use_kafka is set".to_string(),
            });
        }
        Ok(())
    }
}
