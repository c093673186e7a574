//! Groups sealed entries into put-records sized batches.
//!
//! The batcher is greedy first-fit: entries are appended to the open batch
//! while both the entry-count and byte-size limits allow, otherwise the open
//! batch is sealed and a new one starts with the pending entry. A batch that
//! reaches either limit exactly is sealed right away.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::client::PutRecordsRequestEntry;
use crate::record::Record;

/// One entry of a put-records request: a plain record or an aggregated record.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Partition key the service routes this entry by
    pub partition_key: String,

    /// Explicit hash key, if any
    pub explicit_hash_key: Option<String>,

    /// Wire-ready payload
    pub data: Bytes,

    /// The caller records carried by this entry, in submission order
    records: Vec<Record>,

    /// Send attempts that failed so far
    pub(crate) attempts: u32,

    /// Error from the most recent failed attempt
    pub(crate) last_error: Option<String>,
}

impl Entry {
    /// Wrap a single record without aggregation.
    pub fn raw(record: Record) -> Self {
        Self {
            partition_key: record.partition_key.clone(),
            explicit_hash_key: record.explicit_hash_key.clone(),
            data: record.data.clone(),
            records: vec![record],
            attempts: 0,
            last_error: None,
        }
    }

    pub(crate) fn aggregated(
        partition_key: String,
        explicit_hash_key: Option<String>,
        data: Bytes,
        records: Vec<Record>,
    ) -> Self {
        Self {
            partition_key,
            explicit_hash_key,
            data,
            records,
            attempts: 0,
            last_error: None,
        }
    }

    /// Bytes this entry counts against the request size limit.
    pub fn size(&self) -> usize {
        self.data.len() + self.partition_key.len()
    }

    /// The caller records carried by this entry.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Consume the entry, returning its caller records.
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// Whether this entry packs more than one record.
    pub fn is_aggregated(&self) -> bool {
        self.records.len() > 1
    }

    /// Failed send attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn to_request_entry(&self) -> PutRecordsRequestEntry {
        PutRecordsRequestEntry {
            data: self.data.clone(),
            partition_key: self.partition_key.clone(),
            explicit_hash_key: self.explicit_hash_key.clone(),
        }
    }
}

/// Entries destined for one put-records call.
#[derive(Debug, Default)]
pub struct Batch {
    entries: Vec<Entry>,
    size: usize,
}

impl Batch {
    fn push(&mut self, entry: Entry) {
        self.size += entry.size();
        self.entries.push(entry);
    }

    /// Number of entries in the batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes counted against the request size limit.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of caller records across all entries.
    pub fn record_count(&self) -> usize {
        self.entries.iter().map(|e| e.records.len()).sum()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Entry> {
        self.entries
    }
}

/// Greedy first-fit batch builder.
#[derive(Debug)]
pub struct Batcher {
    max_count: usize,
    max_size: usize,
    open: Batch,
    ready: VecDeque<Batch>,
}

impl Batcher {
    /// Create a batcher with the given per-batch entry and byte limits.
    pub fn new(max_count: usize, max_size: usize) -> Self {
        Self {
            max_count: max_count.max(1),
            max_size,
            open: Batch::default(),
            ready: VecDeque::new(),
        }
    }

    /// Append an entry, sealing the open batch first if the entry does not fit.
    pub fn push(&mut self, entry: Entry) {
        let size = entry.size();
        if !self.open.is_empty()
            && (self.open.len() + 1 > self.max_count || self.open.size + size > self.max_size)
        {
            self.seal();
        }

        self.open.push(entry);

        if self.open.len() >= self.max_count || self.open.size >= self.max_size {
            self.seal();
        }
    }

    /// Seal the open batch regardless of fill level. No-op when it is empty.
    pub fn seal(&mut self) {
        if !self.open.is_empty() {
            self.ready.push_back(std::mem::take(&mut self.open));
        }
    }

    /// Take the oldest sealed batch.
    pub fn next_ready(&mut self) -> Option<Batch> {
        self.ready.pop_front()
    }

    /// Whether a sealed batch is waiting for dispatch.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Entries held, open and sealed.
    pub fn len(&self) -> usize {
        self.open.len() + self.ready.iter().map(Batch::len).sum::<usize>()
    }

    /// Check if the batcher holds nothing.
    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.ready.is_empty()
    }

    /// Take every held entry, sealed batches first, in order.
    pub(crate) fn drain_entries(&mut self) -> Vec<Entry> {
        self.seal();
        self.ready.drain(..).flat_map(Batch::into_entries).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(key: &str, data_len: usize) -> Entry {
        Entry::raw(Record::new(vec![0u8; data_len], key))
    }

    #[test]
    fn test_count_limit_seals_batch() {
        let mut batcher = Batcher::new(3, 1_000);
        for _ in 0..7 {
            batcher.push(entry("k", 10));
        }

        let first = batcher.next_ready().expect("first batch");
        let second = batcher.next_ready().expect("second batch");
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        assert!(batcher.next_ready().is_none());
        assert_eq!(batcher.len(), 1);

        batcher.seal();
        assert_eq!(batcher.next_ready().map(|b| b.len()), Some(1));
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_size_limit_seals_before_overflow() {
        // Each entry is 41 bytes: 40 of data plus a 1 byte key
        let mut batcher = Batcher::new(500, 100);
        batcher.push(entry("k", 40));
        batcher.push(entry("k", 40));
        assert!(!batcher.has_ready());

        batcher.push(entry("k", 40));
        let batch = batcher.next_ready().expect("sealed batch");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size(), 82);
    }

    #[test]
    fn test_exact_fit_seals_immediately() {
        let mut batcher = Batcher::new(500, 100);
        batcher.push(entry("k", 99));
        assert!(batcher.has_ready());
    }

    #[test]
    fn test_seal_empty_is_noop() {
        let mut batcher = Batcher::new(10, 100);
        batcher.seal();
        assert!(batcher.next_ready().is_none());
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_drain_entries_keeps_order() {
        let mut batcher = Batcher::new(2, 1_000);
        for i in 0..5 {
            batcher.push(entry(&format!("k{}", i), 1));
        }
        let keys: Vec<String> = batcher
            .drain_entries()
            .into_iter()
            .map(|e| e.partition_key)
            .collect();
        assert_eq!(keys, vec!["k0", "k1", "k2", "k3", "k4"]);
        assert!(batcher.is_empty());
    }

    proptest! {
        #[test]
        fn prop_batches_respect_limits(
            sizes in proptest::collection::vec(1usize..2_000, 1..300),
            max_count in 1usize..50,
            max_size in 2_000usize..20_000,
        ) {
            let mut batcher = Batcher::new(max_count, max_size);
            for size in &sizes {
                batcher.push(entry("k", *size - 1));
            }
            batcher.seal();

            let mut total = 0;
            while let Some(batch) = batcher.next_ready() {
                prop_assert!(!batch.is_empty());
                prop_assert!(batch.len() <= max_count);
                prop_assert!(batch.size() <= max_size);
                total += batch.len();
            }
            prop_assert_eq!(total, sizes.len());
        }
    }
}
