//! The unit of data callers hand to the producer.

use bytes::Bytes;

use crate::error::ProducerError;

/// Maximum size of a single record (data plus partition key): 1 MiB.
pub const MAX_RECORD_SIZE: usize = 1 << 20;

/// Maximum length of a partition key, in characters.
pub const MAX_PARTITION_KEY_LEN: usize = 256;

/// A caller-submitted payload routed by its partition key.
///
/// Records are immutable once admitted. `data` is reference counted, so
/// cloning a record for retries or failure reporting does not copy the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Opaque payload
    pub data: Bytes,

    /// Key used by the service to route the record to a shard
    pub partition_key: String,

    /// Optional hash key overriding the partition key hash
    pub explicit_hash_key: Option<String>,
}

impl Record {
    /// Create a new record.
    pub fn new(data: impl Into<Bytes>, partition_key: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            partition_key: partition_key.into(),
            explicit_hash_key: None,
        }
    }

    /// Attach an explicit hash key.
    pub fn with_explicit_hash_key(mut self, explicit_hash_key: impl Into<String>) -> Self {
        self.explicit_hash_key = Some(explicit_hash_key.into());
        self
    }

    /// Size the service counts against its per-record and per-request limits.
    pub fn size(&self) -> usize {
        self.data.len() + self.partition_key.len()
    }

    /// Check that the record can be admitted under the given size limit.
    pub(crate) fn check(&self, size_limit: usize) -> Result<(), ProducerError> {
        if self.partition_key.is_empty() {
            return Err(ProducerError::InvalidPartitionKey(
                "partition key must not be empty".to_string(),
            ));
        }

        let key_len = self.partition_key.chars().count();
        if key_len > MAX_PARTITION_KEY_LEN {
            return Err(ProducerError::InvalidPartitionKey(format!(
                "partition key length {} exceeds maximum ({})",
                key_len, MAX_PARTITION_KEY_LEN
            )));
        }

        let size = self.size();
        if size > size_limit {
            return Err(ProducerError::RecordTooLarge {
                size,
                limit: size_limit,
            });
        }

        Ok(())
    }
}
