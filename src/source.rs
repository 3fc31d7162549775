use crate::record::LogRecord;
use crate::shipper::Shipper;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One message as delivered by the subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    /// Channel the message arrived on; only used for logging.
    pub topic: String,
    pub payload: Vec<u8>,
}

impl SourceMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        SourceMessage {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Error raised by a record source. Any error ends ingestion.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("subscription transport error: {0}")]
    Transport(String),

    #[error("failed to subscribe to {topics:?}: {reason}")]
    Subscribe { topics: Vec<String>, reason: String },
}

/// A push-style subscription delivering messages in order.
#[async_trait]
pub trait RecordSource: Send {
    /// Wait for the next message.
    ///
    /// **Returns**
    /// - `Ok(Some(..))` for each delivered message, in delivery order.
    /// - `Ok(None)` once the subscription has ended.
    /// - `Err(..)` when the subscription can no longer deliver.
    async fn next_message(&mut self) -> Result<Option<SourceMessage>, SourceError>;
}

/// Source fed through an in-process channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<SourceMessage>,
}

impl ChannelSource {
    /// Create a source and the sender feeding it. The source ends once
    /// every sender is dropped.
    pub fn new(buffer: usize) -> (mpsc::Sender<SourceMessage>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, ChannelSource { rx })
    }
}

#[async_trait]
impl RecordSource for ChannelSource {
    async fn next_message(&mut self) -> Result<Option<SourceMessage>, SourceError> {
        Ok(self.rx.recv().await)
    }
}

/// Feed every message from `source` into `shipper` until the source ends,
/// fails, or `cancel` fires.
///
/// Each record is ingested (including any size-triggered flush) before the
/// next message is requested. Messages that do not decode are logged and
/// skipped. Returns the number of records ingested.
pub async fn pump<S>(mut source: S, shipper: Arc<Shipper>, cancel: CancellationToken) -> Result<u64, SourceError>
where
    S: RecordSource,
{
    let mut ingested = 0u64;
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(ingested, "record source stopped");
                return Ok(ingested);
            }
            next = source.next_message() => next?,
        };

        let Some(message) = message else {
            info!(ingested, "record source ended");
            return Ok(ingested);
        };

        match LogRecord::from_json_slice(&message.payload, Utc::now()) {
            Ok(record) => {
                debug!(topic = %message.topic, "received log record");
                shipper.ingest(record).await;
                ingested += 1;
            }
            Err(e) => {
                shipper.stats().dropped.fetch_add(1, Ordering::Relaxed);
                warn!(topic = %message.topic, error = %e, "dropping undecodable message");
            }
        }
    }
}
