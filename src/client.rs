//! Put-records client: the network collaborator the dispatcher sends batches to.
//!
//! [`Putter`] is the capability the producer depends on. [`HttpPutter`] is the
//! production implementation: an async HTTP client with connection pooling
//! that speaks the PutRecords JSON protocol. Request signing is left to a
//! proxy or to a custom `Putter`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::Config;

/// `X-Amz-Target` value selecting the PutRecords operation.
pub const PUT_RECORDS_TARGET: &str = "Kinesis_20131202.PutRecords";

/// Content type of PutRecords requests.
pub const PUT_RECORDS_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

/// Per-entry error codes worth retrying.
const RETRYABLE_ERROR_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "InternalFailure",
    "KMSThrottlingException",
];

/// Base64 serialization for payload bytes
mod serde_base64 {
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// A put-records request for one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutRecordsRequest {
    pub stream_name: String,
    pub records: Vec<PutRecordsRequestEntry>,
}

/// One entry of a put-records request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutRecordsRequestEntry {
    #[serde(with = "serde_base64")]
    pub data: Bytes,

    pub partition_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_hash_key: Option<String>,
}

/// Response to a put-records request, one result per request entry, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutRecordsOutput {
    #[serde(default)]
    pub failed_record_count: u64,

    pub records: Vec<PutRecordsResultEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_type: Option<String>,
}

/// Outcome of a single request entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PutRecordsResultEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PutRecordsResultEntry {
    /// A successful entry.
    pub fn success(sequence_number: impl Into<String>, shard_id: impl Into<String>) -> Self {
        Self {
            sequence_number: Some(sequence_number.into()),
            shard_id: Some(shard_id.into()),
            ..Self::default()
        }
    }

    /// A failed entry.
    pub fn failure(error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
            ..Self::default()
        }
    }

    /// Whether the entry was written.
    pub fn is_success(&self) -> bool {
        self.error_code.is_none()
    }
}

/// Whether a per-entry error code is transient.
pub fn is_retryable_code(code: &str) -> bool {
    RETRYABLE_ERROR_CODES.contains(&code)
}

/// Errors that can occur during a put-records call as a whole.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Server returned an error status code
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// Failed to encode the request
    #[error("Failed to encode request: {0}")]
    Parse(String),

    /// Response body is unreadable or does not line up with the request
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether the whole request is worth retrying.
    ///
    /// Connection errors, timeouts, server errors (5xx), rate limiting (429)
    /// and malformed responses are retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ClientError::Timeout => true,
            ClientError::Malformed(_) => true,
            ClientError::Status { code, .. } => {
                code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS
            }
            ClientError::Parse(_) => false,
            ClientError::Config(_) => false,
        }
    }
}

/// The network capability that writes batches to the stream.
///
/// Implementations return one result per request entry, in request order.
/// Size and count limits are enforced before this is called.
#[async_trait]
pub trait Putter: Send + Sync + 'static {
    async fn put_records(&self, request: PutRecordsRequest) -> Result<PutRecordsOutput, ClientError>;
}

#[async_trait]
impl<P: Putter + ?Sized> Putter for Arc<P> {
    async fn put_records(&self, request: PutRecordsRequest) -> Result<PutRecordsOutput, ClientError> {
        (**self).put_records(request).await
    }
}

/// HTTP implementation of [`Putter`].
///
/// # Example
///
/// ```no_run
/// use stream_producer::client::HttpPutter;
/// use stream_producer::config::Config;
///
/// let config = Config::new("events");
/// let putter = HttpPutter::new(&config).expect("Failed to create client");
/// println!("Sending to {}", putter.endpoint());
/// ```
pub struct HttpPutter {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// PutRecords endpoint URL
    endpoint: String,

    /// Request timeout duration
    timeout: Duration,
}

impl HttpPutter {
    /// Create a new HTTP putter from the producer configuration.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ClientError> {
        Self::with_settings(
            config.endpoint.clone(),
            config.request_timeout,
            config.max_connections,
        )
    }

    /// Create a new HTTP putter with custom settings.
    pub fn with_settings(
        endpoint: impl Into<String>,
        timeout: Duration,
        max_connections: usize,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(max_connections)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    /// Get the configured endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Putter for HttpPutter {
    async fn put_records(&self, request: PutRecordsRequest) -> Result<PutRecordsOutput, ClientError> {
        let entries = request.records.len();
        let body = serde_json::to_vec(&request).map_err(|e| ClientError::Parse(e.to_string()))?;

        debug!(
            entries = entries,
            stream = %request.stream_name,
            url = %self.endpoint,
            "Sending put-records request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, HeaderValue::from_static(PUT_RECORDS_CONTENT_TYPE))
            .header("X-Amz-Target", HeaderValue::from_static(PUT_RECORDS_TARGET))
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClientError::Timeout
                } else {
                    ClientError::Request(e)
                }
            })?;

        let status = response.status();

        if status.is_success() {
            // Unreadable answers to an accepted call are transient
            let body = response
                .text()
                .await
                .map_err(|e| ClientError::Malformed(format!("unreadable body: {}", e)))?;
            serde_json::from_str(&body)
                .map_err(|e| ClientError::Malformed(format!("invalid body: {}", e)))
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(ClientError::Status {
                code: status,
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(entries: usize) -> PutRecordsRequest {
        PutRecordsRequest {
            stream_name: "events".to_string(),
            records: (0..entries)
                .map(|i| PutRecordsRequestEntry {
                    data: Bytes::from(format!("payload-{}", i)),
                    partition_key: format!("key-{}", i),
                    explicit_hash_key: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Timeout;
        assert_eq!(format!("{}", err), "Request timed out");

        let err = ClientError::Status {
            code: StatusCode::BAD_REQUEST,
            message: "Invalid JSON".to_string(),
        };
        assert!(format!("{}", err).contains("400"));
        assert!(format!("{}", err).contains("Invalid JSON"));
    }

    #[test]
    fn test_retryable_error_detection() {
        assert!(ClientError::Timeout.is_retryable());
        assert!(!ClientError::Parse("unencodable".to_string()).is_retryable());
        assert!(ClientError::Malformed("short".to_string()).is_retryable());

        assert!(ClientError::Status {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Server error".to_string(),
        }
        .is_retryable());

        assert!(ClientError::Status {
            code: StatusCode::TOO_MANY_REQUESTS,
            message: "Rate limited".to_string(),
        }
        .is_retryable());

        assert!(!ClientError::Status {
            code: StatusCode::BAD_REQUEST,
            message: "Bad request".to_string(),
        }
        .is_retryable());

        assert!(!ClientError::Config("config error".to_string()).is_retryable());
    }

    #[test]
    fn test_retryable_codes() {
        assert!(is_retryable_code("ProvisionedThroughputExceededException"));
        assert!(is_retryable_code("InternalFailure"));
        assert!(!is_retryable_code("KMSAccessDeniedException"));
        assert!(!is_retryable_code("ResourceNotFoundException"));
    }

    #[test]
    fn test_request_serialization() {
        let json = serde_json::to_value(request(1)).unwrap();
        assert_eq!(json["StreamName"], "events");
        assert_eq!(json["Records"][0]["PartitionKey"], "key-0");
        assert_eq!(json["Records"][0]["Data"], "cGF5bG9hZC0w");
        assert!(json["Records"][0].get("ExplicitHashKey").is_none());
    }

    #[test]
    fn test_output_deserialization() {
        let json = r#"{
            "FailedRecordCount": 1,
            "Records": [
                {"SequenceNumber": "4960", "ShardId": "shardId-000000000001"},
                {"ErrorCode": "ProvisionedThroughputExceededException", "ErrorMessage": "Rate exceeded"}
            ]
        }"#;

        let output: PutRecordsOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.failed_record_count, 1);
        assert!(output.records[0].is_success());
        assert!(!output.records[1].is_success());
        assert_eq!(
            output.records[1].error_code.as_deref(),
            Some("ProvisionedThroughputExceededException")
        );
    }

    #[test]
    fn test_putter_creation() {
        let config = Config::new("events");
        let putter = HttpPutter::new(&config).unwrap();
        assert_eq!(putter.endpoint(), "http://localhost:4567");
        assert_eq!(putter.timeout(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_http_putter_sends_put_records() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("x-amz-target", PUT_RECORDS_TARGET)
            .match_header("content-type", PUT_RECORDS_CONTENT_TYPE)
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "StreamName": "events"
            })))
            .with_status(200)
            .with_body(
                r#"{"FailedRecordCount":0,"Records":[
                    {"SequenceNumber":"1","ShardId":"shardId-0"},
                    {"SequenceNumber":"2","ShardId":"shardId-0"}]}"#,
            )
            .create_async()
            .await;

        let putter = HttpPutter::with_settings(server.url(), Duration::from_secs(5), 4).unwrap();
        let output = putter.put_records(request(2)).await.expect("request succeeds");

        mock.assert_async().await;
        assert_eq!(output.records.len(), 2);
        assert!(output.records.iter().all(PutRecordsResultEntry::is_success));
    }

    #[tokio::test]
    async fn test_http_putter_maps_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;

        let putter = HttpPutter::with_settings(server.url(), Duration::from_secs(5), 4).unwrap();
        let err = putter.put_records(request(1)).await.unwrap_err();

        assert!(matches!(err, ClientError::Status { code, .. } if code == StatusCode::SERVICE_UNAVAILABLE));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_http_putter_retries_unparseable_success_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let putter = HttpPutter::with_settings(server.url(), Duration::from_secs(5), 4).unwrap();
        let err = putter.put_records(request(1)).await.unwrap_err();

        assert!(matches!(err, ClientError::Malformed(_)));
        assert!(err.is_retryable());
    }
}
