//! Flush scheduling and the background worker that drives the pipeline.
//!
//! A single worker task owns the aggregator, the batcher, the retry queue and
//! the dispatcher. It reacts to five event sources, in priority order:
//!
//! - producer commands (flush, shutdown)
//! - resolved put-records calls
//! - retry entries whose backoff elapsed
//! - new records from the backlog
//! - the flush interval ticker
//!
//! A flush seals every open container and the open batch and hands the
//! resulting batches to the dispatcher. Flushes happen on the interval, when
//! the backlog is saturated, on request, and at shutdown. Batches that fill up
//! on their own are dispatched as soon as they are sealed, and so are retry
//! entries once their backoff has elapsed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::aggregator::Aggregator;
use crate::backoff::Backoff;
use crate::batcher::{Batch, Batcher, Entry};
use crate::buffer::BacklogReceiver;
use crate::client::Putter;
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Resolution};
use crate::error::{FailureReason, FailureRecord};
use crate::producer::ShutdownReport;
use crate::record::Record;
use crate::retry::RetryQueue;

/// Where the pipeline is in its flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FlushState {
    /// Nothing buffered and nothing in flight
    #[default]
    Idle = 0,

    /// Records are buffered in open containers or the open batch
    Accumulating = 1,

    /// A flush was triggered and batches are being handed off
    FlushPending = 2,

    /// Put-records calls are outstanding
    Dispatching = 3,
}

impl FlushState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FlushState::Accumulating,
            2 => FlushState::FlushPending,
            3 => FlushState::Dispatching,
            _ => FlushState::Idle,
        }
    }
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Interval,
    Backlog,
    Manual,
    Shutdown,
}

pub(crate) enum Command {
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<ShutdownReport>),
}

/// Counters shared between the worker and the producer.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub batches_sent: AtomicU64,
    pub in_flight: AtomicUsize,
    state: AtomicU8,
}

impl Counters {
    pub fn state(&self) -> FlushState {
        FlushState::from_u8(self.state.load(Ordering::Relaxed))
    }
}

/// Delivers permanent failures to the caller, once someone subscribed.
pub(crate) struct FailureSink {
    tx: mpsc::UnboundedSender<FailureRecord>,
    subscribed: Arc<AtomicBool>,
}

impl FailureSink {
    pub fn new(tx: mpsc::UnboundedSender<FailureRecord>, subscribed: Arc<AtomicBool>) -> Self {
        Self { tx, subscribed }
    }

    fn send(&self, failure: FailureRecord) {
        if self.subscribed.load(Ordering::Acquire) {
            // Receiver may have been dropped; the failure was already logged
            let _ = self.tx.send(failure);
        }
    }
}

pub(crate) struct Worker {
    backlog: BacklogReceiver,
    commands: mpsc::Receiver<Command>,
    aggregator: Aggregator,
    batcher: Batcher,
    dispatcher: Dispatcher,
    retries: RetryQueue,
    backoff: Arc<dyn Backoff>,
    failures: FailureSink,
    counters: Arc<Counters>,
    ticker: Interval,
    shutdown_timeout: Duration,
    deadline: Option<Instant>,
    closing: bool,
    undelivered: Vec<FailureRecord>,
}

impl Worker {
    pub fn new(
        config: &Config,
        putter: Arc<dyn Putter>,
        backlog: BacklogReceiver,
        commands: mpsc::Receiver<Command>,
        failures: FailureSink,
        counters: Arc<Counters>,
    ) -> Self {
        let mut ticker = interval_at(Instant::now() + config.flush_interval, config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            backlog,
            commands,
            aggregator: Aggregator::new(config),
            batcher: Batcher::new(config.batch_count, config.batch_size),
            dispatcher: Dispatcher::new(
                putter,
                config.stream_name.clone(),
                config.max_connections,
                config.max_retries,
            ),
            retries: RetryQueue::new(),
            backoff: Arc::clone(&config.backoff),
            failures,
            counters,
            ticker,
            shutdown_timeout: config.shutdown_timeout,
            deadline: None,
            closing: false,
            undelivered: Vec::new(),
        }
    }

    /// Run until shutdown is requested or every submitter is gone.
    pub async fn run(mut self) {
        debug!(
            aggregation = self.aggregator.is_enabled(),
            "Producer worker started"
        );

        loop {
            tokio::select! {
                biased;

                Some(command) = self.commands.recv() => match command {
                    Command::Flush(done) => {
                        self.flush(FlushTrigger::Manual).await;
                        let _ = done.send(());
                    }
                    Command::Shutdown(reply) => {
                        let report = self.shutdown().await;
                        let _ = reply.send(report);
                        return;
                    }
                },

                Some(resolution) = self.dispatcher.next_resolution(), if self.dispatcher.in_flight() > 0 => {
                    self.resolve(resolution);
                }

                Some(entry) = self.retries.next_ready(), if !self.retries.is_empty() => {
                    self.batcher.push(entry);
                    for entry in self.retries.take_ready().await {
                        self.batcher.push(entry);
                    }
                    // Due retries go out now rather than on the next tick
                    self.batcher.seal();
                    self.dispatch_ready().await;
                }

                maybe_record = self.backlog.recv() => match maybe_record {
                    Some(record) => self.accept(record).await,
                    None => {
                        info!("All producer handles dropped, draining");
                        let report = self.shutdown().await;
                        // No one is waiting for the report
                        for failure in report.undelivered {
                            self.report(failure);
                        }
                        return;
                    }
                },

                _ = self.ticker.tick() => {
                    self.flush(FlushTrigger::Interval).await;
                }
            }

            self.refresh_state();
        }
    }

    fn push_record(&mut self, record: Record) {
        for entry in self.aggregator.add(record) {
            self.batcher.push(entry);
        }
    }

    /// Move the records queued right now into the pipeline.
    fn drain_backlog(&mut self) {
        let queued = self.backlog.depth();
        for _ in 0..queued {
            match self.backlog.try_recv() {
                Some(record) => self.push_record(record),
                None => break,
            }
        }
    }

    async fn accept(&mut self, record: Record) {
        self.push_record(record);

        if self.backlog.is_saturated() {
            self.flush(FlushTrigger::Backlog).await;
        } else if self.batcher.has_ready() {
            self.dispatch_ready().await;
        }
    }

    async fn flush(&mut self, trigger: FlushTrigger) {
        self.ticker.reset();
        // Records submitted before the flush was requested belong to it
        self.drain_backlog();

        if self.aggregator.is_empty() && self.batcher.is_empty() {
            return;
        }

        self.set_state(FlushState::FlushPending);
        debug!(
            ?trigger,
            buffered_records = self.aggregator.len(),
            batched_entries = self.batcher.len(),
            "Flushing"
        );

        for entry in self.aggregator.flush() {
            self.batcher.push(entry);
        }
        self.batcher.seal();
        self.dispatch_ready().await;
    }

    /// Hand every sealed batch to the dispatcher, in order, waiting until each
    /// one may go.
    async fn dispatch_ready(&mut self) {
        while let Some(batch) = self.batcher.next_ready() {
            if !self.wait_for_slot(&batch).await {
                self.abandon(batch.into_entries());
                continue;
            }

            self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
            self.dispatcher.dispatch(batch);
            self.counters
                .in_flight
                .store(self.dispatcher.in_flight(), Ordering::Relaxed);
            self.set_state(FlushState::Dispatching);
        }
    }

    /// Resolve outstanding calls until `batch` may be dispatched: a slot is
    /// free and no in-flight batch shares a partition key with it.
    ///
    /// Returns `false` if the shutdown deadline passed first.
    async fn wait_for_slot(&mut self, batch: &Batch) -> bool {
        while !self.dispatcher.can_dispatch(batch) {
            let resolution = match self.deadline {
                Some(deadline) => {
                    match timeout_at(deadline, self.dispatcher.next_resolution()).await {
                        Ok(resolution) => resolution,
                        Err(_) => return false,
                    }
                }
                None => self.dispatcher.next_resolution().await,
            };

            match resolution {
                Some(resolution) => self.resolve(resolution),
                None => break,
            }
        }
        true
    }

    fn resolve(&mut self, resolution: Resolution) {
        self.counters
            .in_flight
            .store(self.dispatcher.in_flight(), Ordering::Relaxed);
        self.counters
            .delivered
            .fetch_add(resolution.delivered as u64, Ordering::Relaxed);

        if !resolution.retry.is_empty() {
            let records: usize = resolution.retry.iter().map(|e| e.records().len()).sum();
            warn!(
                entries = resolution.retry.len(),
                records,
                closing = self.closing,
                "Put-records entries failed, retrying"
            );
        }

        for entry in resolution.retry {
            if self.closing {
                self.abandon(vec![entry]);
                continue;
            }

            let delay = self.backoff.delay(entry.attempts);
            self.counters
                .retried
                .fetch_add(entry.records().len() as u64, Ordering::Relaxed);
            trace!(
                partition_key = %entry.partition_key,
                attempts = entry.attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling retry"
            );
            self.retries.schedule(entry, delay);
        }

        for failure in resolution.failed {
            self.report(failure);
        }
    }

    fn report(&mut self, failure: FailureRecord) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            partition_key = %failure.record.partition_key,
            attempts = failure.attempts,
            reason = %failure.reason,
            "Record permanently failed"
        );
        self.failures.send(failure);
    }

    /// Record entries that could not be confirmed before shutdown finished.
    fn abandon(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            let attempts = entry.attempts;
            let last_error = entry.last_error.clone();
            self.undelivered
                .extend(entry.into_records().into_iter().map(|record| FailureRecord {
                    record,
                    reason: FailureReason::Shutdown {
                        last_error: last_error.clone(),
                    },
                    attempts,
                }));
        }
    }

    async fn shutdown(&mut self) -> ShutdownReport {
        self.closing = true;
        let deadline = Instant::now() + self.shutdown_timeout;
        self.deadline = Some(deadline);
        self.backlog.close();

        self.drain_backlog();

        // Pending retries get one last attempt, without waiting out backoff
        let pending = self.retries.drain();
        info!(
            buffered_records = self.aggregator.len(),
            pending_retries = pending.len(),
            in_flight = self.dispatcher.in_flight(),
            "Shutting down producer"
        );
        for entry in pending {
            self.batcher.push(entry);
        }

        self.flush(FlushTrigger::Shutdown).await;

        while self.dispatcher.in_flight() > 0 {
            match timeout_at(deadline, self.dispatcher.next_resolution()).await {
                Ok(Some(resolution)) => self.resolve(resolution),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        in_flight = self.dispatcher.in_flight(),
                        timeout_secs = self.shutdown_timeout.as_secs(),
                        "Shutdown timed out waiting for put-records calls"
                    );
                    let entries = self.dispatcher.abort_all();
                    self.abandon(entries);
                    break;
                }
            }
        }

        self.counters.in_flight.store(0, Ordering::Relaxed);
        self.set_state(FlushState::Idle);

        let report = ShutdownReport {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            undelivered: std::mem::take(&mut self.undelivered),
        };
        info!(
            delivered = report.delivered,
            failed = report.failed,
            undelivered = report.undelivered.len(),
            "Producer stopped"
        );
        report
    }

    fn refresh_state(&self) {
        let state = if self.dispatcher.in_flight() > 0 {
            FlushState::Dispatching
        } else if !self.aggregator.is_empty() || !self.batcher.is_empty() || !self.retries.is_empty() {
            FlushState::Accumulating
        } else {
            FlushState::Idle
        };
        self.set_state(state);
    }

    fn set_state(&self, state: FlushState) {
        let previous = FlushState::from_u8(self.counters.state.swap(state as u8, Ordering::Relaxed));
        if previous != state {
            trace!(from = ?previous, to = ?state, "Flush state changed");
        }
    }
}
