use std::process::ExitCode;
use std::sync::Arc;

use log_shipper::config::ShipperConfig;
use log_shipper::init::init_logging;
use log_shipper::kafka::KafkaSource;
use log_shipper::loki::LokiSink;
use log_shipper::service::{shutdown_signal, ServiceError, ShipperService};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match ShipperConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("log-shipper: {e}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("log-shipper: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "log shipper exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ShipperConfig) -> Result<(), ServiceError> {
    info!(
        loki = %config.loki.url,
        brokers = %config.kafka.brokers,
        topics = ?config.kafka.topics,
        "starting log shipper"
    );

    let source = KafkaSource::connect(&config.kafka).await?;
    let sink = Arc::new(LokiSink::new(config.loki.clone()));

    let report = ShipperService::new(&config, source, sink)
        .run_until(shutdown_signal())
        .await?;
    info!(ingested = report.ingested, "shutdown complete");
    Ok(())
}
