use crate::batch::Batch;
use crate::sink::{FlushOutcome, LogSink};
use async_trait::async_trait;

/// A sink that accepts and discards every batch.
///
/// Useful for measuring the overhead of the shipper itself without any
/// network I/O.
#[derive(Clone, Default)]
pub struct NoopSink;

#[async_trait]
impl LogSink for NoopSink {
    async fn send(&self, _batch: &Batch) -> FlushOutcome {
        FlushOutcome::Delivered
    }
}
