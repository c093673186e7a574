//! Stream Producer - pipe newline-delimited records into a stream
//!
//! Reads records from stdin, one per line, and hands them to the buffering
//! producer, which aggregates, batches and sends them to a put-records
//! endpoint.
//!
//! ## Input
//!
//! Each line is either `partition_key<TAB>payload`, or just `payload`, in
//! which case a random partition key is generated. Empty lines are skipped.
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `PRODUCER_STREAM_NAME`: Target stream (required)
//! - `PRODUCER_ENDPOINT`: Put-records endpoint (default: http://localhost:4567)
//! - `PRODUCER_FLUSH_INTERVAL_MS`: Milliseconds between flushes (default: 1000)
//! - `PRODUCER_BATCH_COUNT`: Entries per request (default: 500)
//! - `PRODUCER_AGGREGATE_BATCH_SIZE`: Bytes per aggregated record
//! - `PRODUCER_MAX_CONNECTIONS`: Requests in flight (default: 24)
//! - `PRODUCER_MAX_RETRIES`: Give up after this many retries (default: never)
//! - `RUST_LOG`: Logging level filter (default: info)
//!
//! Input ends at EOF or on Ctrl+C; either way buffered records are flushed
//! before exiting.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use stream_producer::client::HttpPutter;
use stream_producer::config::Config;
use stream_producer::error::ProducerError;
use stream_producer::producer::{Producer, ProducerHandle};
use stream_producer::record::Record;

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting stream producer...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                stream = %config.stream_name,
                endpoint = %config.endpoint,
                batch_count = config.batch_count,
                flush_interval_ms = config.flush_interval.as_millis() as u64,
                max_retries = ?config.max_retries,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let putter = match HttpPutter::new(&config) {
        Ok(putter) => {
            info!(endpoint = %putter.endpoint(), "HTTP client initialized");
            putter
        }
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let mut producer = match Producer::new(config, Arc::new(putter)) {
        Ok(producer) => producer,
        Err(e) => {
            error!(error = %e, "Failed to start producer");
            std::process::exit(1);
        }
    };

    // Failures are already logged by the producer; this keeps a count
    let failure_handle = producer.notify_failures().map(|mut failures| {
        tokio::spawn(async move {
            let mut count: u64 = 0;
            while failures.recv().await.is_some() {
                count += 1;
            }
            count
        })
    });

    let handle = producer.handle();
    let reader_handle = tokio::spawn(async move { read_stdin(handle).await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        },
        result = reader_handle => match result {
            Ok(lines) => info!(lines, "Input finished"),
            Err(e) => warn!(error = %e, "Input task failed"),
        },
    }

    info!("Initiating graceful shutdown...");
    let stats = producer.stats();
    let report = producer.shutdown().await;

    for failure in &report.undelivered {
        warn!(
            partition_key = %failure.record.partition_key,
            reason = %failure.reason,
            "Record not delivered"
        );
    }

    if let Some(failure_handle) = failure_handle {
        if let Ok(count) = failure_handle.await {
            info!(permanent_failures = count, "Failure channel closed");
        }
    }

    info!(
        submitted = stats.submitted,
        delivered = report.delivered,
        failed = report.failed,
        undelivered = report.undelivered.len(),
        "Stream producer stopped"
    );

    // A pending stdin read would otherwise hold the runtime open
    let code = if report.undelivered.is_empty() && report.failed == 0 { 0 } else { 2 };
    std::process::exit(code);
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Parse one input line into a record. Returns `None` for blank lines.
fn parse_line(line: &str) -> Option<Record> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }

    match line.split_once('\t') {
        Some((key, payload)) if !key.is_empty() => {
            Some(Record::new(payload.as_bytes().to_vec(), key))
        }
        _ => Some(Record::new(
            line.as_bytes().to_vec(),
            Uuid::new_v4().to_string(),
        )),
    }
}

/// Submit stdin lines until EOF or until the producer closes.
///
/// Returns the number of records submitted.
async fn read_stdin(handle: ProducerHandle) -> u64 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut submitted: u64 = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
        };

        let Some(record) = parse_line(&line) else {
            continue;
        };

        match handle.submit(record).await {
            Ok(()) => submitted += 1,
            Err(ProducerError::Closed) => break,
            Err(e) => warn!(error = %e, "Record rejected"),
        }
    }

    submitted
}
