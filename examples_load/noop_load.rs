use std::sync::Arc;
use std::time::Instant;

use log_shipper::config::ShipperConfig;
use log_shipper::noop_sink::NoopSink;
use log_shipper::service::ShipperService;
use log_shipper::source::{ChannelSource, SourceMessage};

#[tokio::main]
async fn main() {
    let config = ShipperConfig {
        batch_size: 500,
        ..ShipperConfig::default()
    };
    let (tx, source) = ChannelSource::new(4096);
    let service = ShipperService::new(&config, source, Arc::new(NoopSink));

    let n: u64 = 200_000;
    let start = Instant::now();

    let producer = tokio::spawn(async move {
        for i in 0..n {
            let payload = format!(
                r#"{{"timestamp":"2024-03-01T12:00:00.000Z","method":"GET","path":"/api/tasks","statusCode":200,"duration":{}}}"#,
                i % 250
            );
            if tx.send(SourceMessage::new("api-logs", payload)).await.is_err() {
                break;
            }
        }
    });

    // the source ends once the producer drops its sender
    let report = match service.run_until(std::future::pending()).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("noop load failed: {e}");
            return;
        }
    };
    let _ = producer.await;

    let elapsed = start.elapsed();
    println!(
        "noop sink: shipped {} records in {:?} (~{:.0} rec/s)",
        report.stats.delivered,
        elapsed,
        report.stats.delivered as f64 / elapsed.as_secs_f64()
    );
}
