//! Mock put-records sender with scripted outcomes

use std::sync::Mutex;

use async_trait::async_trait;
use stream_producer::client::{
    ClientError, PutRecordsOutput, PutRecordsRequest, PutRecordsRequestEntry,
    PutRecordsResultEntry, Putter,
};
use stream_producer::record::Record;
use tokio::time::Instant;

use super::helpers::records_in;

pub const THROTTLED: &str = "ProvisionedThroughputExceededException";

/// How a whole call behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallBehavior {
    /// Answer with per-entry outcomes from the entry policy
    Respond,
    /// Fail the whole request with a transient error
    Timeout,
    /// Never answer
    Hang,
}

/// Per-entry outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Fail(&'static str),
}

type CallPolicy = Box<dyn Fn(usize) -> CallBehavior + Send + Sync>;
type EntryPolicy = Box<dyn Fn(usize, usize, &PutRecordsRequestEntry) -> Outcome + Send + Sync>;

/// A request as the mock saw it.
#[derive(Debug, Clone)]
pub struct Call {
    pub at: Instant,
    pub request: PutRecordsRequest,
}

/// Records every call and answers from configurable policies.
///
/// Without policies every entry succeeds.
pub struct RecordingPutter {
    calls: Mutex<Vec<Call>>,
    delivered: Mutex<Vec<Record>>,
    call_policy: CallPolicy,
    entry_policy: EntryPolicy,
}

impl RecordingPutter {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            call_policy: Box::new(|_| CallBehavior::Respond),
            entry_policy: Box::new(|_, _, _| Outcome::Ok),
        }
    }

    /// Decide each call's behavior from its zero-based index.
    pub fn with_call_policy(
        mut self,
        policy: impl Fn(usize) -> CallBehavior + Send + Sync + 'static,
    ) -> Self {
        self.call_policy = Box::new(policy);
        self
    }

    /// Decide each entry's outcome from the call index, entry index and entry.
    pub fn with_entry_policy(
        mut self,
        policy: impl Fn(usize, usize, &PutRecordsRequestEntry) -> Outcome + Send + Sync + 'static,
    ) -> Self {
        self.entry_policy = Box::new(policy);
        self
    }

    /// Fail the given entry indexes of the first call.
    pub fn failing_first_call(indexes: &'static [usize]) -> Self {
        Self::new().with_entry_policy(move |call, index, _| {
            if call == 0 && indexes.contains(&index) {
                Outcome::Fail(THROTTLED)
            } else {
                Outcome::Ok
            }
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Caller records the mock acknowledged, in acknowledgement order.
    pub fn delivered(&self) -> Vec<Record> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Putter for RecordingPutter {
    async fn put_records(
        &self,
        request: PutRecordsRequest,
    ) -> Result<PutRecordsOutput, ClientError> {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                at: Instant::now(),
                request: request.clone(),
            });
            calls.len() - 1
        };

        match (self.call_policy)(index) {
            CallBehavior::Respond => {}
            CallBehavior::Timeout => return Err(ClientError::Timeout),
            CallBehavior::Hang => std::future::pending::<()>().await,
        }

        let mut output = PutRecordsOutput::default();
        for (position, entry) in request.records.iter().enumerate() {
            match (self.entry_policy)(index, position, entry) {
                Outcome::Ok => {
                    let single = PutRecordsRequest {
                        stream_name: request.stream_name.clone(),
                        records: vec![entry.clone()],
                    };
                    self.delivered.lock().unwrap().extend(records_in(&single));
                    output
                        .records
                        .push(PutRecordsResultEntry::success(index.to_string(), "shardId-000000000000"));
                }
                Outcome::Fail(code) => {
                    output.failed_record_count += 1;
                    output
                        .records
                        .push(PutRecordsResultEntry::failure(code, "scripted failure"));
                }
            }
        }

        Ok(output)
    }
}
