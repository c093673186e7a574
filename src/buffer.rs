//! Ingest backlog between submitting callers and the background worker.
//!
//! The backlog is a bounded tokio mpsc channel. Submitting waits while the
//! channel is full, so callers feel backpressure instead of losing records.
//! Records are checked against the size ceiling before they are queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProducerError;
use crate::record::Record;

/// A sender handle for submitting records to the backlog.
///
/// This can be cloned and shared across many submitting tasks.
#[derive(Clone)]
pub struct BacklogSender {
    tx: mpsc::Sender<Record>,
    closed: CancellationToken,
    record_size_limit: usize,
    submitted: Arc<AtomicU64>,
}

impl BacklogSender {
    /// Submit a record, waiting while the backlog is full.
    ///
    /// Returns an error without queueing if the record is invalid, or if the
    /// backlog is closed before space frees up.
    pub async fn submit(&self, record: Record) -> Result<(), ProducerError> {
        record.check(self.record_size_limit)?;

        if self.closed.is_cancelled() {
            return Err(ProducerError::Closed);
        }

        tokio::select! {
            result = self.tx.send(record) => result.map_err(|_| ProducerError::Closed)?,
            _ = self.closed.cancelled() => return Err(ProducerError::Closed),
        }

        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Submit a record without waiting.
    ///
    /// Returns `ProducerError::BacklogFull` if the backlog is at capacity.
    pub fn try_submit(&self, record: Record) -> Result<(), ProducerError> {
        record.check(self.record_size_limit)?;

        if self.closed.is_cancelled() {
            return Err(ProducerError::Closed);
        }

        self.tx.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProducerError::BacklogFull,
            mpsc::error::TrySendError::Closed(_) => ProducerError::Closed,
        })?;

        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Records currently waiting in the backlog.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Records accepted since the backlog was created.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Whether the backlog stopped accepting records.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Stop accepting records and wake every waiting submitter.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// The consuming end of the backlog, owned by the background worker.
pub struct BacklogReceiver {
    rx: mpsc::Receiver<Record>,
    capacity: usize,
}

impl BacklogReceiver {
    /// Wait for the next record. Returns `None` once every sender is gone
    /// and the backlog is drained.
    pub async fn recv(&mut self) -> Option<Record> {
        self.rx.recv().await
    }

    /// Take the next record if one is waiting.
    pub fn try_recv(&mut self) -> Option<Record> {
        self.rx.try_recv().ok()
    }

    /// Records currently waiting.
    pub fn depth(&self) -> usize {
        self.rx.len()
    }

    /// Whether the backlog is at capacity.
    pub fn is_saturated(&self) -> bool {
        self.rx.len() >= self.capacity
    }

    /// Refuse further sends; records already queued can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Create a backlog holding up to `capacity` records.
///
/// Records larger than `record_size_limit` are rejected at submit time.
pub fn backlog(capacity: usize, record_size_limit: usize) -> (BacklogSender, BacklogReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);

    let sender = BacklogSender {
        tx,
        closed: CancellationToken::new(),
        record_size_limit,
        submitted: Arc::new(AtomicU64::new(0)),
    };
    let receiver = BacklogReceiver { rx, capacity };

    (sender, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MAX_RECORD_SIZE;
    use std::time::Duration;
    use tokio::time::timeout;

    fn create_test_record() -> Record {
        Record::new("test payload", "test-key")
    }

    #[tokio::test]
    async fn test_submit_and_receive() {
        let (sender, mut receiver) = backlog(10, MAX_RECORD_SIZE);

        sender.submit(create_test_record()).await.expect("Submit should succeed");
        assert_eq!(sender.depth(), 1);
        assert_eq!(receiver.depth(), 1);
        assert_eq!(sender.submitted(), 1);

        let record = receiver.recv().await.expect("Should receive record");
        assert_eq!(record.partition_key, "test-key");
        assert_eq!(receiver.depth(), 0);
    }

    #[tokio::test]
    async fn test_oversized_record_never_queued() {
        let (sender, receiver) = backlog(10, 100);

        let result = sender.submit(Record::new(vec![0u8; 200], "k")).await;
        assert!(matches!(result, Err(ProducerError::RecordTooLarge { limit: 100, .. })));
        assert_eq!(receiver.depth(), 0);
        assert_eq!(sender.submitted(), 0);
    }

    #[tokio::test]
    async fn test_submit_blocks_when_full() {
        let (sender, mut receiver) = backlog(2, MAX_RECORD_SIZE);

        sender.submit(create_test_record()).await.unwrap();
        sender.submit(create_test_record()).await.unwrap();
        assert!(receiver.is_saturated());

        // Third submit waits for space
        let blocked = timeout(Duration::from_millis(50), sender.submit(create_test_record())).await;
        assert!(blocked.is_err());

        // Draining one record lets it through
        receiver.recv().await.unwrap();
        let unblocked = timeout(Duration::from_millis(50), sender.submit(create_test_record())).await;
        assert!(matches!(unblocked, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_try_submit_full() {
        let (sender, _receiver) = backlog(2, MAX_RECORD_SIZE);

        sender.try_submit(create_test_record()).unwrap();
        sender.try_submit(create_test_record()).unwrap();

        let result = sender.try_submit(create_test_record());
        assert!(matches!(result, Err(ProducerError::BacklogFull)));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_submitters() {
        let (sender, _receiver) = backlog(1, MAX_RECORD_SIZE);
        sender.submit(create_test_record()).await.unwrap();

        let waiting = sender.clone();
        let handle = tokio::spawn(async move { waiting.submit(create_test_record()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        sender.close();

        let result = timeout(Duration::from_millis(100), handle)
            .await
            .expect("Submitter should wake")
            .expect("Task should not panic");
        assert_eq!(result, Err(ProducerError::Closed));
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_receiver_drains_after_close() {
        let (sender, mut receiver) = backlog(10, MAX_RECORD_SIZE);
        sender.submit(create_test_record()).await.unwrap();
        sender.submit(create_test_record()).await.unwrap();

        receiver.close();
        assert!(matches!(
            sender.try_submit(create_test_record()),
            Err(ProducerError::Closed)
        ));

        assert!(receiver.try_recv().is_some());
        assert!(receiver.try_recv().is_some());
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_returns_none_when_senders_dropped() {
        let (sender, mut receiver) = backlog(10, MAX_RECORD_SIZE);
        sender.submit(create_test_record()).await.unwrap();
        drop(sender);

        assert!(receiver.recv().await.is_some());
        assert!(receiver.recv().await.is_none());
    }
}
