use crate::config::ShipperConfig;
use crate::shipper::{Shipper, StatsSnapshot};
use crate::sink::{FlushOutcome, LogSink};
use crate::source::{pump, RecordSource, SourceError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Error that stops the shipper process.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("record source failed: {0}")]
    Source(#[from] SourceError),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Summary of a completed run.
#[derive(Debug)]
pub struct ShutdownReport {
    /// Records the source delivered and the shipper accepted.
    pub ingested: u64,
    /// Outcome of the final flush; `None` when the buffer was empty.
    pub final_flush: Option<FlushOutcome>,
    pub stats: StatsSnapshot,
}

/// Wires a connected record source, the flush timer and the shipper
/// together for the lifetime of the process.
pub struct ShipperService<S> {
    shipper: Arc<Shipper>,
    source: S,
    flush_interval: Duration,
}

impl<S> ShipperService<S>
where
    S: RecordSource + 'static,
{
    /// `source` is expected to be connected already; the flush timer only
    /// starts once [`run_until`](Self::run_until) is called.
    pub fn new(config: &ShipperConfig, source: S, sink: Arc<dyn LogSink>) -> Self {
        let config = config.clone().normalized();
        let shipper = Shipper::new(sink, config.batch_size, config.failure_policy);
        ShipperService {
            shipper: Arc::new(shipper),
            source,
            flush_interval: config.flush_interval,
        }
    }

    pub fn shipper(&self) -> Arc<Shipper> {
        Arc::clone(&self.shipper)
    }

    /// Ship records until `shutdown` resolves or the source stops.
    ///
    /// On the way out the source and the timer are stopped first, an
    /// in-flight flush is allowed to finish, and whatever is still
    /// buffered is flushed once. A source failure is returned as an error
    /// after that final flush.
    pub async fn run_until<F>(self, shutdown: F) -> Result<ShutdownReport, ServiceError>
    where
        F: Future<Output = ()>,
    {
        let ShipperService { shipper, source, flush_interval } = self;

        let cancel = CancellationToken::new();
        let timer = shipper.spawn_timer(flush_interval, cancel.child_token());
        let mut ingest = tokio::spawn(pump(source, Arc::clone(&shipper), cancel.child_token()));
        info!(
            batch_size = shipper.batch_size(),
            flush_interval_ms = flush_interval.as_millis() as u64,
            "log shipper running"
        );

        let finished = tokio::select! {
            _ = shutdown => {
                info!("shutdown requested");
                None
            }
            res = &mut ingest => Some(res),
        };

        cancel.cancel();
        let pumped = match finished {
            Some(res) => res,
            None => ingest.await,
        };
        let timer = timer.await;

        let final_flush = shipper.shutdown().await;
        let stats = shipper.stats().snapshot();
        info!(
            received = stats.received,
            delivered = stats.delivered,
            dropped = stats.dropped,
            failed_batches = stats.failed_batches,
            "log shipper stopped"
        );

        let ingested = match pumped? {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "record source failed");
                return Err(e.into());
            }
        };
        timer?;

        Ok(ShutdownReport {
            ingested,
            final_flush,
            stats,
        })
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
