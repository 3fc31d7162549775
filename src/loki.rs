use crate::batch::Batch;
use crate::record::LogRecord;
use crate::sink::{FlushOutcome, LogSink, SinkError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Configuration for [`LokiSink`].
///
/// Every batch is pushed as a single stream carrying the static `labels`.
#[derive(Clone, Debug)]
pub struct LokiConfig {
    /// Base URL without path, e.g. "http://loki:3100"
    pub url: String,
    /// Path prefix in front of `/push`, e.g. "loki/api/v1"
    pub api_prefix: String,
    pub labels: BTreeMap<String, String>,
    /// Sent as `X-Scope-OrgID` when Loki runs multi-tenant.
    pub tenant_id: Option<String>,
    pub timeout: Duration,
}

impl Default for LokiConfig {
    fn default() -> Self {
        let labels = [("app", "api-server"), ("level", "info")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LokiConfig {
            url: "http://loki:3100".to_string(),
            api_prefix: "loki/api/v1".to_string(),
            labels,
            tenant_id: None,
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Loki implementation of [`LogSink`] using the HTTP push API.
#[derive(Clone)]
pub struct LokiSink {
    client: Client,
    config: LokiConfig,
}

impl LokiSink {
    pub fn new(config: LokiConfig) -> Self {
        let client = Client::new();
        Self { client, config }
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}/push",
            self.config.url.trim_end_matches('/'),
            self.config.api_prefix.trim_matches('/')
        )
    }

    pub fn config(&self) -> &LokiConfig {
        &self.config
    }
}

/// Body of a Loki push request.
#[derive(Serialize, Debug)]
pub struct PushRequest<'a> {
    pub streams: Vec<PushStream<'a>>,
}

#[derive(Serialize, Debug)]
pub struct PushStream<'a> {
    pub stream: &'a BTreeMap<String, String>,
    pub values: Vec<[String; 2]>,
}

/// Why a single record could not be turned into a push entry.
#[derive(thiserror::Error, Debug)]
pub enum EncodingError {
    #[error("timestamp {0} cannot be expressed in epoch nanoseconds")]
    TimestampOutOfRange(i64),

    #[error("record could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Encode one record as a `[nanoseconds, line]` pair.
///
/// The timestamp is taken at millisecond precision and scaled to
/// nanoseconds.
pub fn encode_entry(record: &LogRecord) -> Result<[String; 2], EncodingError> {
    let millis = record.timestamp().timestamp_millis();
    let nanos = millis
        .checked_mul(NANOS_PER_MILLI)
        .ok_or(EncodingError::TimestampOutOfRange(millis))?;
    let line = serde_json::to_string(record)?;
    Ok([nanos.to_string(), line])
}

/// Build the push body for a batch.
///
/// Records that fail to encode are logged and left out; the second value
/// is how many were dropped.
pub fn encode_push_request<'a>(
    labels: &'a BTreeMap<String, String>,
    batch: &Batch,
) -> (PushRequest<'a>, usize) {
    let mut dropped = 0;
    let mut values = Vec::with_capacity(batch.len());
    for record in batch.records() {
        match encode_entry(record) {
            Ok(entry) => values.push(entry),
            Err(e) => {
                dropped += 1;
                warn!(error = %e, "dropping record that cannot be encoded for loki");
            }
        }
    }
    let request = PushRequest {
        streams: vec![PushStream { stream: labels, values }],
    };
    (request, dropped)
}

#[async_trait]
impl LogSink for LokiSink {
    async fn send(&self, batch: &Batch) -> FlushOutcome {
        let (body, dropped) = encode_push_request(&self.config.labels, batch);
        let entries = body.streams.iter().map(|s| s.values.len()).sum::<usize>();
        if entries == 0 {
            return FlushOutcome::Failed(SinkError::Encoding { dropped });
        }

        let url = self.endpoint();
        debug!(%url, entries, dropped, "pushing batch to loki");

        let mut request = self
            .client
            .post(&url)
            .timeout(self.config.timeout)
            .json(&body);
        if let Some(tenant) = &self.config.tenant_id {
            request = request.header("X-Scope-OrgID", tenant);
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return FlushOutcome::Failed(SinkError::Timeout(self.config.timeout))
            }
            Err(e) => return FlushOutcome::Failed(SinkError::Transport(e.to_string())),
        };

        let status = resp.status();
        if status.is_success() {
            FlushOutcome::Delivered
        } else {
            let body = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
            FlushOutcome::Failed(SinkError::Protocol {
                status: status.as_u16(),
                body,
            })
        }
    }
}
