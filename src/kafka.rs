use crate::source::{RecordSource, SourceError, SourceMessage};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use std::time::Duration;
use tracing::info;

/// Connection settings for [`KafkaSource`].
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses.
    pub brokers: String,
    pub group_id: String,
    pub client_id: String,
    pub topics: Vec<String>,
    /// How long `connect` waits for cluster metadata before giving up.
    pub connect_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        KafkaConfig {
            brokers: "kafka:9092".to_string(),
            group_id: "log-processor".to_string(),
            client_id: "log-consumer".to_string(),
            topics: vec!["api-logs".to_string(), "error-logs".to_string()],
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl From<KafkaError> for SourceError {
    fn from(e: KafkaError) -> Self {
        SourceError::Transport(e.to_string())
    }
}

/// Record source reading JSON log messages from a set of Kafka topics
/// through one consumer group.
pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    /// Create the consumer, check that the cluster answers, and subscribe.
    ///
    /// Any failure here means the shipper has nothing to ship and is
    /// reported as a [`SourceError`].
    pub async fn connect(config: &KafkaConfig) -> Result<Self, SourceError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("client.id", &config.client_id)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()?;

        // metadata fetch is a blocking librdkafka call
        let timeout = config.connect_timeout;
        let (consumer, brokers) = tokio::task::spawn_blocking(move || {
            let brokers = consumer.fetch_metadata(None, timeout)?.brokers().len();
            Ok::<_, KafkaError>((consumer, brokers))
        })
        .await
        .map_err(|e| SourceError::Transport(e.to_string()))??;

        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| SourceError::Subscribe {
                topics: config.topics.clone(),
                reason: e.to_string(),
            })?;

        info!(
            brokers,
            group = %config.group_id,
            topics = ?config.topics,
            "connected to kafka"
        );
        Ok(KafkaSource { consumer })
    }
}

#[async_trait]
impl RecordSource for KafkaSource {
    async fn next_message(&mut self) -> Result<Option<SourceMessage>, SourceError> {
        let message = self.consumer.recv().await?;
        Ok(Some(SourceMessage {
            topic: message.topic().to_string(),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }))
    }
}
