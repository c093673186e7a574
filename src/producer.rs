//! Public producer API.
//!
//! A [`Producer`] owns the background worker. Records go in through
//! [`Producer::submit`] (or a cloned [`ProducerHandle`]); permanent failures
//! come out through [`Producer::notify_failures`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::buffer::{backlog, BacklogSender};
use crate::client::Putter;
use crate::config::{Config, ConfigError};
use crate::error::{FailureRecord, ProducerError};
use crate::record::Record;
use crate::scheduler::{Command, Counters, FailureSink, FlushState, Worker};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Point-in-time producer statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Records accepted into the backlog
    pub submitted: u64,

    /// Records confirmed written
    pub delivered: u64,

    /// Records permanently failed
    pub failed: u64,

    /// Record retries scheduled
    pub retried: u64,

    /// Put-records calls started
    pub batches_sent: u64,

    /// Records waiting in the backlog
    pub backlog_depth: usize,

    /// Put-records calls outstanding
    pub in_flight: usize,

    /// Current flush state
    pub state: FlushState,
}

/// Outcome of a graceful shutdown.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Records confirmed written over the producer's lifetime
    pub delivered: u64,

    /// Records permanently failed over the producer's lifetime
    pub failed: u64,

    /// Records whose delivery could not be confirmed before shutdown finished
    pub undelivered: Vec<FailureRecord>,
}

/// A cloneable handle for submitting records from many tasks.
#[derive(Clone)]
pub struct ProducerHandle {
    backlog: BacklogSender,
}

impl ProducerHandle {
    /// Submit a record, waiting while the backlog is full.
    ///
    /// # Errors
    ///
    /// Returns `ProducerError::RecordTooLarge` or
    /// `ProducerError::InvalidPartitionKey` if the record cannot be admitted,
    /// and `ProducerError::Closed` once shutdown has begun.
    pub async fn submit(&self, record: Record) -> Result<(), ProducerError> {
        self.backlog.submit(record).await
    }

    /// Submit `data` under `partition_key`.
    pub async fn put(
        &self,
        data: impl Into<Bytes>,
        partition_key: impl Into<String>,
    ) -> Result<(), ProducerError> {
        self.submit(Record::new(data, partition_key)).await
    }

    /// Submit a record without waiting; fails with `BacklogFull` instead.
    pub fn try_submit(&self, record: Record) -> Result<(), ProducerError> {
        self.backlog.try_submit(record)
    }

    /// Whether the producer stopped accepting records.
    pub fn is_closed(&self) -> bool {
        self.backlog.is_closed()
    }
}

/// Buffering, aggregating, retrying producer for a put-records stream.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use stream_producer::{Config, HttpPutter, Producer};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::new("events");
/// let putter = HttpPutter::new(&config)?;
/// let producer = Producer::new(config, Arc::new(putter))?;
///
/// producer.put("hello", "user-42").await?;
/// let report = producer.shutdown().await;
/// assert!(report.undelivered.is_empty());
/// # Ok(())
/// # }
/// ```
pub struct Producer {
    handle: ProducerHandle,
    commands: mpsc::Sender<Command>,
    failures: Option<mpsc::UnboundedReceiver<FailureRecord>>,
    subscribed: Arc<AtomicBool>,
    counters: Arc<Counters>,
    worker: JoinHandle<()>,
}

impl Producer {
    /// Validate `config` and start the background worker.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config, putter: Arc<dyn Putter>) -> Result<Self, ConfigError> {
        config.validate()?;

        let (sender, receiver) = backlog(config.backlog_count, config.record_size_limit());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let subscribed = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let worker = Worker::new(
            &config,
            putter,
            receiver,
            command_rx,
            FailureSink::new(failure_tx, Arc::clone(&subscribed)),
            Arc::clone(&counters),
        );

        info!(
            stream = %config.stream_name,
            batch_count = config.batch_count,
            batch_size = config.batch_size,
            aggregation = config.aggregation_enabled(),
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            max_connections = config.max_connections,
            "Producer started"
        );

        Ok(Self {
            handle: ProducerHandle { backlog: sender },
            commands: command_tx,
            failures: Some(failure_rx),
            subscribed,
            counters,
            worker: tokio::spawn(worker.run()),
        })
    }

    /// A cloneable submit handle.
    pub fn handle(&self) -> ProducerHandle {
        self.handle.clone()
    }

    /// Submit a record, waiting while the backlog is full.
    ///
    /// See [`ProducerHandle::submit`].
    pub async fn submit(&self, record: Record) -> Result<(), ProducerError> {
        self.handle.submit(record).await
    }

    /// Submit `data` under `partition_key`.
    pub async fn put(
        &self,
        data: impl Into<Bytes>,
        partition_key: impl Into<String>,
    ) -> Result<(), ProducerError> {
        self.handle.put(data, partition_key).await
    }

    /// Take the receiver of permanently failed records.
    ///
    /// Returns `None` after the first call. Failures that happen before the
    /// receiver is taken are only logged.
    pub fn notify_failures(&mut self) -> Option<mpsc::UnboundedReceiver<FailureRecord>> {
        let receiver = self.failures.take()?;
        self.subscribed.store(true, Ordering::Release);
        Some(receiver)
    }

    /// Send everything buffered now, regardless of size thresholds.
    ///
    /// Returns once the resulting batches are handed off for sending, not
    /// when they are acknowledged. Returns immediately if nothing is buffered.
    pub async fn flush(&self) -> Result<(), ProducerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(done_tx))
            .await
            .map_err(|_| ProducerError::Closed)?;
        done_rx.await.map_err(|_| ProducerError::Closed)
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            submitted: self.handle.backlog.submitted(),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            batches_sent: self.counters.batches_sent.load(Ordering::Relaxed),
            backlog_depth: self.handle.backlog.depth(),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            state: self.counters.state(),
        }
    }

    /// Stop accepting records, drain everything buffered, and wait for
    /// outstanding sends up to the configured shutdown timeout.
    ///
    /// Every handle starts returning `ProducerError::Closed`. Records that
    /// could not be confirmed are returned in the report rather than on the
    /// failure channel.
    pub async fn shutdown(self) -> ShutdownReport {
        self.handle.backlog.close();

        let (reply_tx, reply_rx) = oneshot::channel();
        let report = match self.commands.send(Command::Shutdown(reply_tx)).await {
            Ok(()) => reply_rx.await.ok(),
            Err(_) => None,
        };

        if let Err(e) = self.worker.await {
            warn!(error = %e, "Producer worker did not exit cleanly");
        }

        report.unwrap_or_else(|| {
            warn!("Producer worker stopped before shutdown completed");
            ShutdownReport {
                delivered: self.counters.delivered.load(Ordering::Relaxed),
                failed: self.counters.failed.load(Ordering::Relaxed),
                undelivered: Vec::new(),
            }
        })
    }
}
