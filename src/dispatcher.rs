//! Sends batches through the [`Putter`] and interprets per-entry outcomes.
//!
//! Each batch is sent on its own task; at most `max_in_flight` batches are
//! outstanding at once. A batch is held back while an earlier batch carrying
//! any of its partition keys is still in flight, so records sharing a key reach
//! the sender in dispatch order. The entries of an in-flight batch stay with
//! the dispatcher so they can be accounted for even if the send never resolves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, warn};

use crate::batcher::{Batch, Entry};
use crate::client::{is_retryable_code, ClientError, PutRecordsOutput, PutRecordsRequest, Putter};
use crate::error::{FailureReason, FailureRecord};

/// What became of a resolved batch.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Caller records confirmed written
    pub delivered: usize,

    /// Entries that failed transiently and should be tried again
    pub retry: Vec<Entry>,

    /// Records given up on
    pub failed: Vec<FailureRecord>,
}

impl Resolution {
    fn record_permanent(&mut self, entry: Entry, reason: FailureReason) {
        let attempts = entry.attempts;
        self.failed.extend(entry.into_records().into_iter().map(|record| FailureRecord {
            record,
            reason: reason.clone(),
            attempts,
        }));
    }

    fn record_transient(&mut self, mut entry: Entry, error: String, max_retries: Option<u32>) {
        entry.attempts += 1;
        entry.last_error = Some(error.clone());

        match max_retries {
            Some(max) if entry.attempts > max => {
                self.record_permanent(entry, FailureReason::RetriesExhausted { last_error: error });
            }
            _ => self.retry.push(entry),
        }
    }
}

/// Classify the outcome of one put-records call.
///
/// Successful entries count as delivered. Entries failing with a retryable
/// error code, and every entry of a call that failed as a whole with a
/// retryable error, are returned for retry until `max_retries` is exceeded.
/// Anything else is a permanent failure.
pub fn resolve(
    entries: Vec<Entry>,
    result: Result<PutRecordsOutput, ClientError>,
    max_retries: Option<u32>,
) -> Resolution {
    let mut resolution = Resolution::default();

    let result = result.and_then(|output| {
        if output.records.len() == entries.len() {
            Ok(output)
        } else {
            Err(ClientError::Malformed(format!(
                "expected {} results, got {}",
                entries.len(),
                output.records.len()
            )))
        }
    });

    match result {
        Ok(output) => {
            for (mut entry, outcome) in entries.into_iter().zip(output.records) {
                match outcome.error_code {
                    None => resolution.delivered += entry.records().len(),
                    Some(code) if is_retryable_code(&code) => {
                        resolution.record_transient(entry, code, max_retries);
                    }
                    Some(code) => {
                        entry.attempts += 1;
                        let message = match outcome.error_message {
                            Some(message) => format!("{}: {}", code, message),
                            None => code,
                        };
                        resolution.record_permanent(entry, FailureReason::NonRetryable(message));
                    }
                }
            }
        }
        Err(e) if e.is_retryable() => {
            let error = e.to_string();
            for entry in entries {
                resolution.record_transient(entry, error.clone(), max_retries);
            }
        }
        Err(e) => {
            let error = e.to_string();
            for mut entry in entries {
                entry.attempts += 1;
                resolution.record_permanent(entry, FailureReason::NonRetryable(error.clone()));
            }
        }
    }

    resolution
}

/// Cancels the put-records call when its dispatch task is aborted.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs put-records calls with a bounded number in flight.
pub struct Dispatcher {
    putter: Arc<dyn Putter>,
    stream_name: String,
    max_in_flight: usize,
    max_retries: Option<u32>,
    tasks: JoinSet<(u64, Result<PutRecordsOutput, ClientError>)>,
    in_flight: HashMap<u64, Vec<Entry>>,
    busy_keys: HashMap<String, usize>,
    next_batch: u64,
}

fn partition_keys(entries: &[Entry]) -> HashSet<&str> {
    entries
        .iter()
        .flat_map(|e| e.records().iter().map(|r| r.partition_key.as_str()))
        .collect()
}

impl Dispatcher {
    pub fn new(
        putter: Arc<dyn Putter>,
        stream_name: impl Into<String>,
        max_in_flight: usize,
        max_retries: Option<u32>,
    ) -> Self {
        Self {
            putter,
            stream_name: stream_name.into(),
            max_in_flight: max_in_flight.max(1),
            max_retries,
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
            busy_keys: HashMap::new(),
            next_batch: 0,
        }
    }

    /// Batches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether another batch may be sent right now.
    pub fn is_saturated(&self) -> bool {
        self.in_flight.len() >= self.max_in_flight
    }

    /// Whether `batch` may be sent right now: a slot is free and no in-flight
    /// batch carries any of its partition keys.
    pub fn can_dispatch(&self, batch: &Batch) -> bool {
        !self.is_saturated()
            && partition_keys(batch.entries())
                .iter()
                .all(|key| !self.busy_keys.contains_key(*key))
    }

    /// Start sending a batch. Callers wait for [`Dispatcher::can_dispatch`] first.
    pub fn dispatch(&mut self, batch: Batch) {
        let id = self.next_batch;
        self.next_batch += 1;

        let entries = batch.into_entries();
        for key in partition_keys(&entries) {
            *self.busy_keys.entry(key.to_string()).or_insert(0) += 1;
        }
        let request = PutRecordsRequest {
            stream_name: self.stream_name.clone(),
            records: entries.iter().map(Entry::to_request_entry).collect(),
        };

        debug!(
            batch = id,
            entries = entries.len(),
            records = entries.iter().map(|e| e.records().len()).sum::<usize>(),
            in_flight = self.in_flight.len() + 1,
            "Dispatching batch"
        );

        self.in_flight.insert(id, entries);

        let putter = Arc::clone(&self.putter);
        self.tasks.spawn(async move {
            // A panicking putter fails the batch instead of losing it
            let call = tokio::spawn(async move { putter.put_records(request).await });
            let _guard = AbortOnDrop(call.abort_handle());
            let result = match call.await {
                Ok(result) => result,
                Err(e) => Err(ClientError::Malformed(format!("put-records task failed: {}", e))),
            };
            (id, result)
        });
    }

    /// Wait for the next in-flight batch to resolve.
    ///
    /// Returns `None` when nothing is in flight.
    pub async fn next_resolution(&mut self) -> Option<Resolution> {
        loop {
            match self.tasks.join_next().await? {
                Ok((id, result)) => {
                    let Some(entries) = self.in_flight.remove(&id) else {
                        warn!(batch = id, "Resolved batch was not in flight");
                        continue;
                    };
                    self.release_keys(&entries);
                    if let Err(e) = &result {
                        warn!(batch = id, error = %e, "Put-records call failed");
                    }
                    return Some(resolve(entries, result, self.max_retries));
                }
                Err(e) => {
                    // Only reachable if the wrapper task itself was cancelled
                    warn!(error = %e, "Dispatch task did not complete");
                }
            }
        }
    }

    fn release_keys(&mut self, entries: &[Entry]) {
        for key in partition_keys(entries) {
            if let Some(count) = self.busy_keys.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    self.busy_keys.remove(key);
                }
            }
        }
    }

    /// Abandon every in-flight batch, returning their entries.
    pub fn abort_all(&mut self) -> Vec<Entry> {
        self.tasks.abort_all();
        self.busy_keys.clear();
        let mut batches: Vec<(u64, Vec<Entry>)> = self.in_flight.drain().collect();
        batches.sort_by_key(|(id, _)| *id);
        batches.into_iter().flat_map(|(_, entries)| entries).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::Batcher;
    use crate::client::PutRecordsResultEntry;
    use crate::record::Record;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn entries(n: usize) -> Vec<Entry> {
        (0..n)
            .map(|i| Entry::raw(Record::new(format!("r{}", i), format!("k{}", i))))
            .collect()
    }

    fn output(codes: &[Option<&str>]) -> PutRecordsOutput {
        PutRecordsOutput {
            failed_record_count: codes.iter().filter(|c| c.is_some()).count() as u64,
            records: codes
                .iter()
                .map(|c| match c {
                    Some(code) => PutRecordsResultEntry::failure(*code, "failed"),
                    None => PutRecordsResultEntry::success("1", "shardId-0"),
                })
                .collect(),
            encryption_type: None,
        }
    }

    #[test]
    fn test_partial_failure_retries_only_failed_entries() {
        let throttled = Some("ProvisionedThroughputExceededException");
        let result = Ok(output(&[None, throttled, None, throttled, None]));

        let resolution = resolve(entries(5), result, None);
        assert_eq!(resolution.delivered, 3);
        assert!(resolution.failed.is_empty());

        let retried: Vec<&str> = resolution
            .retry
            .iter()
            .map(|e| e.partition_key.as_str())
            .collect();
        assert_eq!(retried, vec!["k1", "k3"]);
        assert!(resolution.retry.iter().all(|e| e.attempts() == 1));
    }

    #[test]
    fn test_whole_request_failure_retries_everything() {
        let resolution = resolve(entries(3), Err(ClientError::Timeout), None);
        assert_eq!(resolution.delivered, 0);
        assert_eq!(resolution.retry.len(), 3);
    }

    #[test]
    fn test_non_retryable_request_failure_is_permanent() {
        let err = ClientError::Parse("bad body".to_string());
        let resolution = resolve(entries(2), Err(err), None);
        assert!(resolution.retry.is_empty());
        assert_eq!(resolution.failed.len(), 2);
        assert!(matches!(resolution.failed[0].reason, FailureReason::NonRetryable(_)));
    }

    #[test]
    fn test_non_retryable_code_is_permanent() {
        let result = Ok(output(&[Some("KMSAccessDeniedException"), None]));
        let resolution = resolve(entries(2), result, None);
        assert_eq!(resolution.delivered, 1);
        assert_eq!(resolution.failed.len(), 1);
        assert_eq!(resolution.failed[0].record.partition_key, "k0");
        assert_eq!(resolution.failed[0].attempts, 1);
    }

    #[test]
    fn test_give_up_threshold() {
        let mut pending = entries(1);
        for attempt in 1..=3 {
            let resolution = resolve(pending, Err(ClientError::Timeout), Some(2));
            if attempt <= 2 {
                assert_eq!(resolution.retry.len(), 1);
                pending = resolution.retry;
            } else {
                assert!(resolution.retry.is_empty());
                assert_eq!(resolution.failed.len(), 1);
                assert_eq!(resolution.failed[0].attempts, 3);
                assert!(matches!(
                    resolution.failed[0].reason,
                    FailureReason::RetriesExhausted { .. }
                ));
                return;
            }
        }
    }

    #[test]
    fn test_mismatched_response_is_transient() {
        let resolution = resolve(entries(3), Ok(output(&[None])), None);
        assert_eq!(resolution.delivered, 0);
        assert_eq!(resolution.retry.len(), 3);
    }

    struct SlowPutter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Putter for SlowPutter {
        async fn put_records(
            &self,
            request: PutRecordsRequest,
        ) -> Result<PutRecordsOutput, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(PutRecordsOutput {
                records: request
                    .records
                    .iter()
                    .map(|_| PutRecordsResultEntry::success("1", "shardId-0"))
                    .collect(),
                ..PutRecordsOutput::default()
            })
        }
    }

    fn batch(n: usize) -> Batch {
        let mut batcher = Batcher::new(500, 1 << 20);
        for entry in entries(n) {
            batcher.push(entry);
        }
        batcher.seal();
        batcher.next_ready().expect("batch")
    }

    #[tokio::test]
    async fn test_dispatch_respects_in_flight_limit() {
        let putter = Arc::new(SlowPutter {
            calls: AtomicUsize::new(0),
        });
        let mut dispatcher = Dispatcher::new(putter.clone(), "events", 2, None);

        dispatcher.dispatch(batch(2));
        assert!(!dispatcher.is_saturated());
        dispatcher.dispatch(batch(3));
        assert!(dispatcher.is_saturated());
        assert_eq!(dispatcher.in_flight(), 2);

        let mut delivered = 0;
        while let Some(resolution) = dispatcher.next_resolution().await {
            delivered += resolution.delivered;
        }
        assert_eq!(delivered, 5);
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(putter.calls.load(Ordering::SeqCst), 2);
    }

    fn keyed_batch(keys: &[&str]) -> Batch {
        let mut batcher = Batcher::new(500, 1 << 20);
        for key in keys {
            batcher.push(Entry::raw(Record::new("data", *key)));
        }
        batcher.seal();
        batcher.next_ready().expect("batch")
    }

    #[tokio::test]
    async fn test_batch_sharing_a_key_waits_for_earlier_batch() {
        let putter = Arc::new(SlowPutter {
            calls: AtomicUsize::new(0),
        });
        let mut dispatcher = Dispatcher::new(putter, "events", 8, None);

        let first = keyed_batch(&["a", "b"]);
        assert!(dispatcher.can_dispatch(&first));
        dispatcher.dispatch(first);

        assert!(!dispatcher.can_dispatch(&keyed_batch(&["b"])));
        assert!(!dispatcher.can_dispatch(&keyed_batch(&["c", "a"])));
        assert!(dispatcher.can_dispatch(&keyed_batch(&["c"])));

        dispatcher.next_resolution().await.expect("resolution");
        assert!(dispatcher.can_dispatch(&keyed_batch(&["b"])));
    }

    #[tokio::test]
    async fn test_abort_all_releases_keys() {
        let putter = Arc::new(SlowPutter {
            calls: AtomicUsize::new(0),
        });
        let mut dispatcher = Dispatcher::new(putter, "events", 8, None);
        dispatcher.dispatch(keyed_batch(&["a"]));
        assert!(!dispatcher.can_dispatch(&keyed_batch(&["a"])));

        dispatcher.abort_all();
        assert!(dispatcher.can_dispatch(&keyed_batch(&["a"])));
    }

    #[tokio::test]
    async fn test_abort_all_returns_in_flight_entries() {
        let putter = Arc::new(SlowPutter {
            calls: AtomicUsize::new(0),
        });
        let mut dispatcher = Dispatcher::new(putter, "events", 4, None);
        dispatcher.dispatch(batch(2));
        dispatcher.dispatch(batch(1));

        let abandoned = dispatcher.abort_all();
        assert_eq!(abandoned.len(), 3);
        assert_eq!(dispatcher.in_flight(), 0);
        assert!(dispatcher.next_resolution().await.is_none());
    }
}
