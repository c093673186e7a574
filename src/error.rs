//! Error types surfaced to producer callers.
//!
//! Two categories are visible to callers: [`ProducerError`] is returned
//! synchronously when a record cannot be admitted, and [`FailureRecord`] is
//! delivered asynchronously once the producer gives up on a record it had
//! already accepted. Transient send failures never show up here; they are
//! retried internally.

use thiserror::Error;

use crate::record::Record;

/// Errors returned synchronously when submitting a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProducerError {
    /// Record (data plus partition key) is larger than the per-record ceiling
    #[error("record size {size} exceeds maximum allowed ({limit})")]
    RecordTooLarge { size: usize, limit: usize },

    /// Partition key is empty or too long
    #[error("invalid partition key: {0}")]
    InvalidPartitionKey(String),

    /// Backlog is full (only returned by non-blocking submits)
    #[error("backlog is full")]
    BacklogFull,

    /// Producer is shutting down and no longer accepts records
    #[error("producer has been closed")]
    Closed,
}

/// Why the producer gave up on a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    /// Every allowed attempt failed with a transient error
    #[error("retries exhausted, last error: {last_error}")]
    RetriesExhausted { last_error: String },

    /// The service rejected the record with an error that retrying cannot fix
    #[error("non-retryable error: {0}")]
    NonRetryable(String),

    /// Delivery could not be confirmed before shutdown completed
    #[error("undelivered at shutdown{}", last_error_suffix(.last_error))]
    Shutdown { last_error: Option<String> },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(", last error: {}", e),
        None => String::new(),
    }
}

/// A record the producer permanently failed to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record with partition key '{}' failed after {attempts} attempt(s): {reason}", .record.partition_key)]
pub struct FailureRecord {
    /// The original record, as submitted
    pub record: Record,

    /// Final error detail
    pub reason: FailureReason,

    /// Number of send attempts made for this record
    pub attempts: u32,
}
