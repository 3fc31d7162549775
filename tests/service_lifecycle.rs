use log_shipper::config::ShipperConfig;
use log_shipper::loki::{LokiConfig, LokiSink};
use log_shipper::service::{ServiceError, ShipperService};
use log_shipper::shipper::FailurePolicy;
use log_shipper::sink::FlushOutcome;
use log_shipper::source::{ChannelSource, RecordSource, SourceError, SourceMessage};
use mockito::Server;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

fn config(loki_url: String, batch_size: usize) -> ShipperConfig {
    ShipperConfig {
        batch_size,
        // long enough that only size triggers and shutdown flush in these tests
        flush_interval: Duration::from_secs(60),
        failure_policy: FailurePolicy::Discard,
        loki: LokiConfig {
            url: loki_url,
            timeout: Duration::from_secs(2),
            ..LokiConfig::default()
        },
        ..ShipperConfig::default()
    }
}

fn message(seq: u64) -> SourceMessage {
    let topic = if seq % 5 == 0 { "error-logs" } else { "api-logs" };
    SourceMessage::new(
        topic,
        format!(r#"{{"timestamp":"2024-03-01T12:00:00.000Z","seq":{seq}}}"#),
    )
}

#[tokio::test]
async fn size_flushes_then_final_flush_on_shutdown() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .with_status(204)
        .expect(3)
        .create_async()
        .await;

    let (tx, source) = ChannelSource::new(64);
    let sink = Arc::new(LokiSink::new(config(server.url(), 10).loki));
    let service = ShipperService::new(&config(server.url(), 10), source, sink);
    let shipper = service.shipper();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let run = tokio::spawn(service.run_until(async {
        let _ = stop_rx.await;
    }));

    for i in 0..25 {
        tx.send(message(i)).await.unwrap();
    }

    let ingested = async {
        while shipper.stats().snapshot().received < 25 {
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(5), ingested)
        .await
        .expect("records were not ingested in time");
    assert_eq!(shipper.buffered(), 5);

    stop_tx.send(()).unwrap();
    let report = run.await.unwrap().unwrap();

    assert_eq!(report.ingested, 25);
    assert!(matches!(report.final_flush, Some(FlushOutcome::Delivered)));
    assert_eq!(report.stats.delivered, 25);
    mock.assert_async().await;
}

#[tokio::test]
async fn shutdown_with_empty_buffer_sends_nothing() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .expect(0)
        .create_async()
        .await;

    let (_tx, source) = ChannelSource::new(8);
    let sink = Arc::new(LokiSink::new(config(server.url(), 10).loki));
    let service = ShipperService::new(&config(server.url(), 10), source, sink);

    let report = service.run_until(async {}).await.unwrap();

    assert_eq!(report.ingested, 0);
    assert!(report.final_flush.is_none());
    mock.assert_async().await;
}

#[tokio::test]
async fn source_end_drains_buffer() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let (tx, source) = ChannelSource::new(8);
    for i in 0..3 {
        tx.send(message(i)).await.unwrap();
    }
    drop(tx);

    let sink = Arc::new(LokiSink::new(config(server.url(), 10).loki));
    let service = ShipperService::new(&config(server.url(), 10), source, sink);
    let report = service.run_until(std::future::pending()).await.unwrap();

    assert_eq!(report.ingested, 3);
    assert!(matches!(report.final_flush, Some(FlushOutcome::Delivered)));
    mock.assert_async().await;
}

/// Delivers a fixed set of messages, then loses its connection.
struct FlakySource {
    remaining: Vec<SourceMessage>,
}

#[async_trait::async_trait]
impl RecordSource for FlakySource {
    async fn next_message(&mut self) -> Result<Option<SourceMessage>, SourceError> {
        if self.remaining.is_empty() {
            Err(SourceError::Transport("broker connection lost".into()))
        } else {
            Ok(Some(self.remaining.remove(0)))
        }
    }
}

#[tokio::test]
async fn source_failure_is_fatal_after_final_flush() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let source = FlakySource {
        remaining: (0..4).map(message).collect(),
    };
    let sink = Arc::new(LokiSink::new(config(server.url(), 10).loki));
    let service = ShipperService::new(&config(server.url(), 10), source, sink);
    let shipper = service.shipper();

    let result = service.run_until(std::future::pending()).await;

    assert!(matches!(result, Err(ServiceError::Source(SourceError::Transport(_)))));
    assert_eq!(shipper.stats().snapshot().delivered, 4);
    mock.assert_async().await;
}

#[tokio::test]
async fn unreachable_loki_drops_requeued_records_when_final_flush_fails() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut cfg = config(format!("http://127.0.0.1:{port}"), 2);
    cfg.failure_policy = FailurePolicy::default();

    let (tx, source) = ChannelSource::new(8);
    for i in 0..4 {
        tx.send(message(i)).await.unwrap();
    }
    drop(tx);

    let sink = Arc::new(LokiSink::new(cfg.loki.clone()));
    let service = ShipperService::new(&cfg, source, sink);
    let report = service.run_until(std::future::pending()).await.unwrap();

    // the first size flush fails and requeues; the rest wait out the retry
    // delay, so all four reach the final flush, which fails and drops them
    assert_eq!(report.ingested, 4);
    assert!(matches!(report.final_flush, Some(FlushOutcome::Failed(_))));
    assert_eq!(report.stats.delivered, 0);
    assert_eq!(report.stats.dropped, 4);
}
