//! Config builders and request inspection helpers

use std::sync::Arc;
use std::time::Duration;

use stream_producer::backoff::ConstantBackoff;
use stream_producer::client::PutRecordsRequest;
use stream_producer::config::Config;
use stream_producer::record::Record;
use stream_producer::{deaggregate, is_aggregated};

/// Config for a test stream: no aggregation, a short constant backoff and an
/// interval long enough that only explicit flushes send anything.
pub fn test_config() -> Config {
    let mut config = Config::new("test-stream");
    config.flush_interval = Duration::from_secs(3600);
    config.backoff = Arc::new(ConstantBackoff(Duration::from_millis(10)));
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

/// Every caller record carried by a request, unpacked from aggregated entries.
pub fn records_in(request: &PutRecordsRequest) -> Vec<Record> {
    request
        .records
        .iter()
        .flat_map(|entry| {
            deaggregate(&entry.partition_key, &entry.data).expect("entry should deaggregate")
        })
        .collect()
}

/// Member counts of each entry of a request (1 for plain records).
pub fn entry_sizes(request: &PutRecordsRequest) -> Vec<usize> {
    request
        .records
        .iter()
        .map(|entry| {
            if is_aggregated(&entry.data) {
                deaggregate(&entry.partition_key, &entry.data)
                    .expect("entry should deaggregate")
                    .len()
            } else {
                1
            }
        })
        .collect()
}

/// Payloads as strings, for readable assertions.
pub fn payloads(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .map(|r| String::from_utf8_lossy(&r.data).into_owned())
        .collect()
}
