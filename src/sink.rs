use crate::batch::Batch;
use async_trait::async_trait;
use std::time::Duration;

/// Result of handing one batch to a [`LogSink`].
#[derive(Debug)]
pub enum FlushOutcome {
    /// The sink accepted the batch.
    Delivered,
    /// The batch was not accepted; the reason is kept for logging and for
    /// deciding whether the records are worth retrying.
    Failed(SinkError),
}

impl FlushOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, FlushOutcome::Delivered)
    }
}

/// Why a sink failed to accept a batch.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("sink responded with status {status}: {body}")]
    Protocol { status: u16, body: String },

    #[error("none of the {dropped} records in the batch could be encoded")]
    Encoding { dropped: usize },
}

impl SinkError {
    /// Whether sending the same records again could succeed.
    ///
    /// Network level failures, server errors and throttling are worth a
    /// retry. Other client errors mean the payload itself was rejected.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Timeout(_) | SinkError::Transport(_) => true,
            SinkError::Protocol { status, .. } => *status >= 500 || *status == 429,
            SinkError::Encoding { .. } => false,
        }
    }
}

/// Asynchronous destination for batches detached by the shipper.
///
/// Implementations perform exactly one delivery attempt per call and never
/// retry internally; retry decisions belong to the shipper. `send` is
/// awaited only after the batch has left the shared buffer, so a slow sink
/// never blocks ingestion.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Deliver a batch to the backend.
    ///
    /// **Returns**
    /// - [`FlushOutcome::Delivered`] if the backend accepted the batch.
    /// - [`FlushOutcome::Failed`] for transport errors, timeouts, non-success
    ///   responses, or a batch with no encodable record.
    async fn send(&self, batch: &Batch) -> FlushOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SinkError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(SinkError::Transport("connection refused".into()).is_retryable());
        assert!(SinkError::Protocol { status: 503, body: String::new() }.is_retryable());
        assert!(SinkError::Protocol { status: 429, body: String::new() }.is_retryable());
        assert!(!SinkError::Protocol { status: 400, body: "entry out of order".into() }.is_retryable());
        assert!(!SinkError::Encoding { dropped: 3 }.is_retryable());
    }
}
