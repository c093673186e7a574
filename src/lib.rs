//! Stream Producer Library
//!
//! A client-side buffering producer for put-records style stream services.
//! Callers submit small records at any rate; the producer packs them into
//! aggregated records, groups those into size and count limited batches,
//! sends the batches, and retries partial failures with backoff.
//!
//! - **config**: Limits, defaults and environment-based configuration
//! - **record**: The caller record and its admission checks
//! - **buffer**: Bounded ingest backlog with backpressure
//! - **aggregator**: Packs records into aggregated records
//! - **batcher**: Greedy first-fit grouping of entries into batches
//! - **client**: The `Putter` sender capability and its HTTP implementation
//! - **dispatcher**: Bounded in-flight sends and per-entry outcome handling
//! - **retry**: Delay queue for entries waiting out their backoff
//! - **backoff**: Pluggable retry delay strategies
//! - **scheduler**: Flush triggers and the background worker
//! - **producer**: The public producer API
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stream_producer::config::Config;
//! use stream_producer::client::HttpPutter;
//! use stream_producer::producer::Producer;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Create the HTTP sender
//!     let putter = HttpPutter::new(&config).expect("Failed to create client");
//!
//!     // Start the producer and watch for permanent failures
//!     let mut producer = Producer::new(config, Arc::new(putter)).expect("Invalid config");
//!     let mut failures = producer.notify_failures().expect("First subscriber");
//!     tokio::spawn(async move {
//!         while let Some(failure) = failures.recv().await {
//!             eprintln!("{}", failure);
//!         }
//!     });
//!
//!     producer.put("temperature=21.5", "sensor-7").await.ok();
//!     let report = producer.shutdown().await;
//!     println!("delivered {}", report.delivered);
//! }
//! ```

pub mod aggregator;
pub mod backoff;
pub mod batcher;
pub mod buffer;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod producer;
pub mod record;
pub mod retry;
pub mod scheduler;

pub use aggregator::{deaggregate, is_aggregated, AggregationError, Aggregator};
pub use backoff::{Backoff, ConstantBackoff, ExponentialBackoff};
pub use batcher::{Batch, Batcher, Entry};
pub use client::{
    ClientError, HttpPutter, PutRecordsOutput, PutRecordsRequest, PutRecordsRequestEntry,
    PutRecordsResultEntry, Putter,
};
pub use config::{AggregationKey, Config, ConfigError};
pub use error::{FailureReason, FailureRecord, ProducerError};
pub use producer::{Producer, ProducerHandle, ProducerStats, ShutdownReport};
pub use record::Record;
pub use scheduler::{FlushState, FlushTrigger};
