//! Configuration module for the stream producer.
//!
//! Defaults and hard ceilings mirror the limits of a put-records style write
//! API: at most 500 entries and 5 MiB per request, 1 MiB per record, and
//! 50 KB per aggregated record. Requests above a ceiling are rejected by
//! [`Config::validate`], never clamped.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::backoff::{Backoff, ExponentialBackoff};
use crate::record::MAX_RECORD_SIZE;

/// Maximum size of a single put-records request: 5 MiB
pub const MAX_REQUEST_SIZE: usize = 5 << 20;

/// Maximum number of entries in a single put-records request
pub const MAX_RECORDS_PER_REQUEST: usize = 500;

/// Maximum encoded size of an aggregated record: 50 KB
pub const MAX_AGGREGATION_SIZE: usize = 51_200;

/// Maximum number of records in an aggregated record.
///
/// Effectively unbounded; in practice aggregation is limited by
/// [`MAX_AGGREGATION_SIZE`].
pub const MAX_AGGREGATION_COUNT: u64 = 4_294_967_295;

/// Default flush interval
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of batches allowed in flight at once
const DEFAULT_MAX_CONNECTIONS: usize = 24;

/// Upper bound on batches in flight
const MAX_CONNECTIONS: usize = 256;

/// Default time allowed for in-flight sends to resolve during shutdown
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default endpoint for the HTTP sender
const DEFAULT_ENDPOINT: &str = "http://localhost:4567";

/// Default HTTP request timeout
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How records are grouped into aggregated records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregationKey {
    /// A single open container takes records of any partition key
    #[default]
    Any,

    /// One open container per distinct partition key
    PartitionKey,
}

impl FromStr for AggregationKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(AggregationKey::Any),
            "partition" | "partition_key" => Ok(AggregationKey::PartitionKey),
            other => Err(format!("'{}' is not one of: any, partition", other)),
        }
    }
}

/// Configuration for the producer.
///
/// All settings can be loaded from `PRODUCER_*` environment variables via
/// [`Config::from_env`]; see the field docs for the variable names.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target stream (`PRODUCER_STREAM_NAME`)
    pub stream_name: String,

    /// Regular interval for flushing buffered records (`PRODUCER_FLUSH_INTERVAL_MS`)
    pub flush_interval: Duration,

    /// Maximum entries per put-records request (`PRODUCER_BATCH_COUNT`)
    pub batch_count: usize,

    /// Maximum bytes per put-records request (`PRODUCER_BATCH_SIZE`)
    pub batch_size: usize,

    /// Maximum records per aggregated record (`PRODUCER_AGGREGATE_BATCH_COUNT`)
    pub aggregate_batch_count: u64,

    /// Maximum bytes per aggregated record (`PRODUCER_AGGREGATE_BATCH_SIZE`)
    pub aggregate_batch_size: usize,

    /// Container grouping policy (`PRODUCER_AGGREGATION_KEY`)
    pub aggregation_key: AggregationKey,

    /// Backlog capacity before submits start blocking (`PRODUCER_BACKLOG_COUNT`)
    pub backlog_count: usize,

    /// Maximum batches in flight at once (`PRODUCER_MAX_CONNECTIONS`)
    pub max_connections: usize,

    /// Retries allowed per record before giving up; `None` retries forever
    /// (`PRODUCER_MAX_RETRIES`)
    pub max_retries: Option<u32>,

    /// Time allowed for in-flight sends to resolve on shutdown
    /// (`PRODUCER_SHUTDOWN_TIMEOUT_SECS`)
    pub shutdown_timeout: Duration,

    /// Backoff strategy for failed records. Entries are resent as soon as
    /// their delay elapses (`PRODUCER_BACKOFF_MIN_MS`, `PRODUCER_BACKOFF_MAX_MS`)
    pub backoff: Arc<dyn Backoff>,

    /// Put-records endpoint used by the HTTP sender (`PRODUCER_ENDPOINT`)
    pub endpoint: String,

    /// HTTP request timeout (`PRODUCER_REQUEST_TIMEOUT_SECS`)
    pub request_timeout: Duration,
}

/// Error type for configuration failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("Configuration error for {var}: {message}")]
    Env { var: String, message: String },

    /// A setting is out of range
    #[error("Configuration error for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

impl Config {
    /// Create a configuration for the given stream with default settings.
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults. The result is validated before it
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is not a valid value for its field
    /// or the resulting configuration fails [`Config::validate`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use stream_producer::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Stream: {}", config.stream_name);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(stream_name) = env::var("PRODUCER_STREAM_NAME") {
            config.stream_name = stream_name;
        }

        if let Some(ms) = parse_var::<u64>("PRODUCER_FLUSH_INTERVAL_MS")? {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(count) = parse_var("PRODUCER_BATCH_COUNT")? {
            config.batch_count = count;
        }
        if let Some(size) = parse_var("PRODUCER_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(count) = parse_var("PRODUCER_AGGREGATE_BATCH_COUNT")? {
            config.aggregate_batch_count = count;
        }
        if let Some(size) = parse_var("PRODUCER_AGGREGATE_BATCH_SIZE")? {
            config.aggregate_batch_size = size;
        }
        if let Some(policy) = parse_var("PRODUCER_AGGREGATION_KEY")? {
            config.aggregation_key = policy;
        }

        // The backlog follows the batch count unless set explicitly
        config.backlog_count =
            parse_var("PRODUCER_BACKLOG_COUNT")?.unwrap_or(config.batch_count);

        if let Some(connections) = parse_var("PRODUCER_MAX_CONNECTIONS")? {
            config.max_connections = connections;
        }
        if let Some(retries) = parse_var("PRODUCER_MAX_RETRIES")? {
            config.max_retries = Some(retries);
        }
        if let Some(secs) = parse_var::<u64>("PRODUCER_SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        let min_ms = parse_var::<u64>("PRODUCER_BACKOFF_MIN_MS")?;
        let max_ms = parse_var::<u64>("PRODUCER_BACKOFF_MAX_MS")?;
        if min_ms.is_some() || max_ms.is_some() {
            let defaults = ExponentialBackoff::default();
            let backoff = ExponentialBackoff {
                min: min_ms.map(Duration::from_millis).unwrap_or(defaults.min),
                max: max_ms.map(Duration::from_millis).unwrap_or(defaults.max),
                ..defaults
            };
            if backoff.min > backoff.max {
                return Err(ConfigError::Env {
                    var: "PRODUCER_BACKOFF_MIN_MS".to_string(),
                    message: "backoff minimum exceeds backoff maximum".to_string(),
                });
            }
            config.backoff = Arc::new(backoff);
        }

        if let Ok(endpoint) = env::var("PRODUCER_ENDPOINT") {
            config.endpoint = endpoint.trim_end_matches('/').to_string();
        }
        if let Some(secs) = parse_var::<u64>("PRODUCER_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check every threshold against its hard ceiling.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_name.trim().is_empty() {
            return Err(ConfigError::invalid("stream_name", "must not be empty"));
        }

        if self.flush_interval.is_zero() {
            return Err(ConfigError::invalid(
                "flush_interval",
                "must be greater than 0",
            ));
        }

        check_range("batch_count", self.batch_count as u64, MAX_RECORDS_PER_REQUEST as u64)?;
        check_range("batch_size", self.batch_size as u64, MAX_REQUEST_SIZE as u64)?;
        check_range(
            "aggregate_batch_count",
            self.aggregate_batch_count,
            MAX_AGGREGATION_COUNT,
        )?;
        check_range(
            "aggregate_batch_size",
            self.aggregate_batch_size as u64,
            MAX_AGGREGATION_SIZE as u64,
        )?;

        if self.aggregate_batch_size > self.batch_size {
            return Err(ConfigError::invalid(
                "aggregate_batch_size",
                format!(
                    "{} exceeds batch_size ({})",
                    self.aggregate_batch_size, self.batch_size
                ),
            ));
        }

        if self.backlog_count == 0 {
            return Err(ConfigError::invalid("backlog_count", "must be greater than 0"));
        }

        check_range("max_connections", self.max_connections as u64, MAX_CONNECTIONS as u64)?;

        Ok(())
    }

    /// Whether records are packed into aggregated records.
    ///
    /// Aggregation is off when both aggregation limits sit at their maximum
    /// values, which is also the default.
    pub fn aggregation_enabled(&self) -> bool {
        !(self.aggregate_batch_count == MAX_AGGREGATION_COUNT
            && self.aggregate_batch_size == MAX_AGGREGATION_SIZE)
    }

    /// Largest record that can be admitted: a record must fit a request on its own.
    pub fn record_size_limit(&self) -> usize {
        MAX_RECORD_SIZE.min(self.batch_size)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            batch_count: MAX_RECORDS_PER_REQUEST,
            batch_size: MAX_REQUEST_SIZE,
            aggregate_batch_count: MAX_AGGREGATION_COUNT,
            aggregate_batch_size: MAX_AGGREGATION_SIZE,
            aggregation_key: AggregationKey::default(),
            backlog_count: MAX_RECORDS_PER_REQUEST,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_retries: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            backoff: Arc::new(ExponentialBackoff::default()),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

fn check_range(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be greater than 0"));
    }
    if value > max {
        return Err(ConfigError::invalid(
            field,
            format!("{} exceeds maximum allowed ({})", value, max),
        ));
    }
    Ok(())
}

/// Parse an optional environment variable.
fn parse_var<T>(var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Env {
                var: var.to_string(),
                message: format!("'{}' is not valid: {}", value, e),
            }),
        Err(_) => Ok(None),
    }
}
