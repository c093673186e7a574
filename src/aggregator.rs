//! Packs small records into aggregated records.
//!
//! Aggregated records use the Kinesis Producer Library format so stock
//! deaggregators can unpack them:
//!
//! ```text
//! | magic (4 bytes) | protobuf AggregatedRecord | md5(protobuf) (16 bytes) |
//! ```
//!
//! The aggregator keeps one open container per bucket. With
//! [`AggregationKey::Any`] there is a single bucket; with
//! [`AggregationKey::PartitionKey`] every distinct partition key gets its own.
//! A container is sealed when adding the next record would break the size or
//! count limit, when it reaches the count limit, or when a flush forces it.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use prost::encoding::{encoded_len_varint, key_len};
use prost::Message;
use thiserror::Error;
use tracing::trace;

use crate::batcher::Entry;
use crate::config::{AggregationKey, Config};
use crate::record::Record;

/// Leading bytes that mark an aggregated record.
pub const MAGIC: [u8; 4] = [0xF3, 0x89, 0x9A, 0xC2];

/// Length of the trailing MD5 digest.
const DIGEST_LEN: usize = 16;

mod pb {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AggregatedRecord {
        #[prost(string, repeated, tag = "1")]
        pub partition_key_table: Vec<String>,
        #[prost(string, repeated, tag = "2")]
        pub explicit_hash_key_table: Vec<String>,
        #[prost(message, repeated, tag = "3")]
        pub records: Vec<Record>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Record {
        #[prost(uint64, required, tag = "1")]
        pub partition_key_index: u64,
        #[prost(uint64, optional, tag = "2")]
        pub explicit_hash_key_index: Option<u64>,
        #[prost(bytes = "bytes", required, tag = "3")]
        pub data: bytes::Bytes,
    }
}

/// Errors while unpacking an aggregated record.
#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("aggregated record digest mismatch")]
    DigestMismatch,

    #[error("failed to decode aggregated record: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("{table} index {index} out of range")]
    IndexOutOfRange { table: &'static str, index: u64 },
}

/// Encoded length of one entry in a key table.
fn table_entry_len(key: &str) -> usize {
    key_len(1) + encoded_len_varint(key.len() as u64) + key.len()
}

/// Encoded length of one `records` element, including its field key.
fn record_entry_len(
    partition_key_index: u64,
    explicit_hash_key_index: Option<u64>,
    data_len: usize,
) -> usize {
    let mut inner = key_len(1) + encoded_len_varint(partition_key_index);
    if let Some(index) = explicit_hash_key_index {
        inner += key_len(2) + encoded_len_varint(index);
    }
    inner += key_len(3) + encoded_len_varint(data_len as u64) + data_len;
    key_len(3) + encoded_len_varint(inner as u64) + inner
}

/// Where a record would land in a container and what it would cost.
struct Placement {
    partition_key_index: u64,
    explicit_hash_key_index: Option<u64>,
    new_partition_key: bool,
    new_explicit_hash_key: bool,
    added_len: usize,
}

/// An open aggregated record.
#[derive(Debug)]
struct Container {
    message: pb::AggregatedRecord,
    partition_keys: HashMap<String, u64>,
    explicit_hash_keys: HashMap<String, u64>,
    records: Vec<Record>,
    body_len: usize,
    opened: u64,
}

impl Container {
    fn new(opened: u64) -> Self {
        Self {
            message: pb::AggregatedRecord::default(),
            partition_keys: HashMap::new(),
            explicit_hash_keys: HashMap::new(),
            records: Vec::new(),
            body_len: 0,
            opened,
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn envelope_key_len(&self) -> usize {
        self.records.first().map_or(0, |r| r.partition_key.len())
    }

    /// Size counted against the limits: encoded container plus envelope key.
    fn size(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        MAGIC.len() + self.body_len + DIGEST_LEN + self.envelope_key_len()
    }

    fn place(&self, record: &Record) -> Placement {
        let mut added_len = 0;

        let (partition_key_index, new_partition_key) =
            match self.partition_keys.get(&record.partition_key) {
                Some(index) => (*index, false),
                None => {
                    added_len += table_entry_len(&record.partition_key);
                    (self.message.partition_key_table.len() as u64, true)
                }
            };

        let (explicit_hash_key_index, new_explicit_hash_key) = match &record.explicit_hash_key {
            Some(key) => match self.explicit_hash_keys.get(key) {
                Some(index) => (Some(*index), false),
                None => {
                    added_len += table_entry_len(key);
                    (Some(self.message.explicit_hash_key_table.len() as u64), true)
                }
            },
            None => (None, false),
        };

        added_len += record_entry_len(
            partition_key_index,
            explicit_hash_key_index,
            record.data.len(),
        );

        Placement {
            partition_key_index,
            explicit_hash_key_index,
            new_partition_key,
            new_explicit_hash_key,
            added_len,
        }
    }

    /// Size the container would have after adding `record`.
    fn size_with(&self, record: &Record) -> usize {
        let envelope = if self.is_empty() {
            record.partition_key.len()
        } else {
            self.envelope_key_len()
        };
        MAGIC.len() + self.body_len + self.place(record).added_len + DIGEST_LEN + envelope
    }

    fn push(&mut self, record: Record) {
        let placement = self.place(&record);

        if placement.new_partition_key {
            self.partition_keys
                .insert(record.partition_key.clone(), placement.partition_key_index);
            self.message
                .partition_key_table
                .push(record.partition_key.clone());
        }
        if placement.new_explicit_hash_key {
            if let (Some(key), Some(index)) =
                (&record.explicit_hash_key, placement.explicit_hash_key_index)
            {
                self.explicit_hash_keys.insert(key.clone(), index);
                self.message.explicit_hash_key_table.push(key.clone());
            }
        }

        self.message.records.push(pb::Record {
            partition_key_index: placement.partition_key_index,
            explicit_hash_key_index: placement.explicit_hash_key_index,
            data: record.data.clone(),
        });
        self.body_len += placement.added_len;
        self.records.push(record);
    }

    /// Close the container and produce its entry.
    ///
    /// A container with a single member is sent as a plain record.
    fn seal(mut self) -> Entry {
        if self.records.len() == 1 {
            if let Some(record) = self.records.pop() {
                return Entry::raw(record);
            }
        }

        let body = self.message.encode_to_vec();
        let digest = Md5::digest(&body);

        let mut data = BytesMut::with_capacity(MAGIC.len() + body.len() + DIGEST_LEN);
        data.extend_from_slice(&MAGIC);
        data.extend_from_slice(&body);
        data.extend_from_slice(digest.as_slice());

        let (partition_key, explicit_hash_key) = self
            .records
            .first()
            .map(|r| (r.partition_key.clone(), r.explicit_hash_key.clone()))
            .unwrap_or_default();

        trace!(
            records = self.records.len(),
            bytes = data.len(),
            "Sealed aggregated record"
        );

        Entry::aggregated(partition_key, explicit_hash_key, data.freeze(), self.records)
    }
}

/// Packs records into aggregated records under size and count limits.
#[derive(Debug)]
pub struct Aggregator {
    enabled: bool,
    policy: AggregationKey,
    max_count: u64,
    max_size: usize,
    open: HashMap<String, Container>,
    next_container: u64,
    buffered: usize,
}

impl Aggregator {
    /// Create an aggregator from the producer configuration.
    pub fn new(config: &Config) -> Self {
        let mut aggregator = Self::with_limits(
            config.aggregation_key,
            config.aggregate_batch_count,
            config.aggregate_batch_size,
        );
        aggregator.enabled = config.aggregation_enabled();
        aggregator
    }

    /// Create an enabled aggregator with explicit limits.
    pub fn with_limits(policy: AggregationKey, max_count: u64, max_size: usize) -> Self {
        Self {
            enabled: true,
            policy,
            max_count: max_count.max(1),
            max_size,
            open: HashMap::new(),
            next_container: 0,
            buffered: 0,
        }
    }

    /// Whether records are being aggregated or passed through.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Add a record, returning any entries sealed as a result, in order.
    pub fn add(&mut self, record: Record) -> Vec<Entry> {
        if !self.enabled {
            return vec![Entry::raw(record)];
        }

        let bucket = match self.policy {
            AggregationKey::Any => String::new(),
            AggregationKey::PartitionKey => record.partition_key.clone(),
        };
        let mut sealed = Vec::new();

        // Too big for any container: goes out raw, behind what its bucket holds
        if Container::new(0).size_with(&record) > self.max_size {
            if let Some(container) = self.take(&bucket) {
                sealed.push(container.seal());
            }
            sealed.push(Entry::raw(record));
            return sealed;
        }

        let full = self.open.get(&bucket).is_some_and(|c| {
            !c.is_empty()
                && (c.len() as u64 >= self.max_count || c.size_with(&record) > self.max_size)
        });
        if full {
            if let Some(container) = self.take(&bucket) {
                sealed.push(container.seal());
            }
        }

        let opened = self.next_container;
        self.next_container += 1;
        let container = self
            .open
            .entry(bucket.clone())
            .or_insert_with(|| Container::new(opened));
        container.push(record);
        self.buffered += 1;

        let reached_count = container.len() as u64 >= self.max_count;
        if reached_count {
            if let Some(container) = self.take(&bucket) {
                sealed.push(container.seal());
            }
        }

        sealed
    }

    /// Seal every open container regardless of fill level, oldest first.
    pub fn flush(&mut self) -> Vec<Entry> {
        let mut containers: Vec<Container> = self.open.drain().map(|(_, c)| c).collect();
        containers.sort_by_key(|c| c.opened);
        self.buffered = 0;
        containers.into_iter().map(Container::seal).collect()
    }

    /// Records held in open containers.
    pub fn len(&self) -> usize {
        self.buffered
    }

    /// Check if no container is open.
    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    fn take(&mut self, bucket: &str) -> Option<Container> {
        let container = self.open.remove(bucket)?;
        self.buffered -= container.len();
        Some(container)
    }
}

/// Whether `data` is an aggregated record.
pub fn is_aggregated(data: &[u8]) -> bool {
    data.len() >= MAGIC.len() + DIGEST_LEN && data.starts_with(&MAGIC)
}

/// Unpack an entry's payload into the records it carries.
///
/// Payloads that are not aggregated come back as a single record under
/// `partition_key`.
pub fn deaggregate(partition_key: &str, data: &Bytes) -> Result<Vec<Record>, AggregationError> {
    if !is_aggregated(data) {
        return Ok(vec![Record::new(data.clone(), partition_key)]);
    }

    let body = data.slice(MAGIC.len()..data.len() - DIGEST_LEN);
    let digest = &data[data.len() - DIGEST_LEN..];
    if Md5::digest(&body).as_slice() != digest {
        return Err(AggregationError::DigestMismatch);
    }

    let message = pb::AggregatedRecord::decode(body)?;
    message
        .records
        .into_iter()
        .map(|r| -> Result<Record, AggregationError> {
            let partition_key = message
                .partition_key_table
                .get(r.partition_key_index as usize)
                .ok_or(AggregationError::IndexOutOfRange {
                    table: "partition key",
                    index: r.partition_key_index,
                })?;
            let explicit_hash_key = match r.explicit_hash_key_index {
                Some(index) => Some(
                    message
                        .explicit_hash_key_table
                        .get(index as usize)
                        .cloned()
                        .ok_or(AggregationError::IndexOutOfRange {
                            table: "explicit hash key",
                            index,
                        })?,
                ),
                None => None,
            };
            Ok(Record {
                data: r.data,
                partition_key: partition_key.clone(),
                explicit_hash_key,
            })
        })
        .collect()
}
