use crate::batch::RequeueLimits;
use crate::env::*;
#[cfg(feature = "kafka")]
use crate::kafka::KafkaConfig;
use crate::loki::LokiConfig;
use crate::shipper::FailurePolicy;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);
/// One send plus at least one resend.
const MIN_ATTEMPTS: u32 = 2;

/// Everything the shipper binary needs to run.
///
/// **Fields**
/// - `batch_size`: buffered records that trigger a flush.
/// - `flush_interval`: period of the flush timer, flushing partial batches.
/// - `failure_policy`: what happens to a batch the sink did not accept.
/// - `loki`: sink endpoint, labels and request timeout.
/// - `kafka`: subscription settings.
/// - `log_level`: filter directive for the shipper's own logs.
#[derive(Clone, Debug)]
pub struct ShipperConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub failure_policy: FailurePolicy,
    pub loki: LokiConfig,
    #[cfg(feature = "kafka")]
    pub kafka: KafkaConfig,
    pub log_level: String,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_millis(5000),
            failure_policy: FailurePolicy::default(),
            loki: LokiConfig::default(),
            #[cfg(feature = "kafka")]
            kafka: KafkaConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Error returned when the environment holds an unusable value.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ShipperConfig {
    /// Build the configuration from process environment variables, using
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_opt)
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut loki = defaults.loki;
        if let Some(url) = lookup(LOKI_URL_ENV) {
            loki.url = url;
        }
        if let Some(prefix) = lookup(LOKI_API_PREFIX_ENV) {
            loki.api_prefix = prefix;
        }
        if let Some(labels) = lookup(LOKI_LABELS_ENV) {
            loki.labels = parse_labels(&labels)?;
        }
        loki.tenant_id = lookup(LOKI_TENANT_ID_ENV);
        if let Some(ms) = parse_opt::<u64, _>(&lookup, LOKI_TIMEOUT_MS_ENV)? {
            loki.timeout = Duration::from_millis(ms);
        }

        let failure_policy = match lookup(FAILURE_POLICY_ENV) {
            None => defaults.failure_policy,
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "discard" => FailurePolicy::Discard,
                "requeue" => FailurePolicy::default(),
                _ => {
                    return Err(ConfigError::Invalid {
                        key: FAILURE_POLICY_ENV,
                        value: raw,
                        reason: "expected `requeue` or `discard`".to_string(),
                    })
                }
            },
        };
        let failure_policy = match failure_policy {
            FailurePolicy::Requeue(limits) => FailurePolicy::Requeue(RequeueLimits {
                max_attempts: parse_opt(&lookup, MAX_ATTEMPTS_ENV)?.unwrap_or(limits.max_attempts),
                max_buffered: parse_opt(&lookup, MAX_BUFFERED_ENV)?.unwrap_or(limits.max_buffered),
            }),
            FailurePolicy::Discard => FailurePolicy::Discard,
        };

        #[cfg(feature = "kafka")]
        let kafka = {
            let mut kafka = defaults.kafka;
            if let Some(brokers) = lookup(KAFKA_BROKERS_ENV) {
                kafka.brokers = brokers;
            }
            if let Some(group) = lookup(KAFKA_GROUP_ID_ENV) {
                kafka.group_id = group;
            }
            if let Some(client) = lookup(KAFKA_CLIENT_ID_ENV) {
                kafka.client_id = client;
            }
            if let Some(topics) = lookup(KAFKA_TOPICS_ENV) {
                kafka.topics = split_list(&topics);
                if kafka.topics.is_empty() {
                    return Err(ConfigError::Invalid {
                        key: KAFKA_TOPICS_ENV,
                        value: topics,
                        reason: "no topic names".to_string(),
                    });
                }
            }
            kafka
        };

        let config = ShipperConfig {
            batch_size: parse_opt(&lookup, BATCH_SIZE_ENV)?.unwrap_or(defaults.batch_size),
            flush_interval: parse_opt(&lookup, FLUSH_INTERVAL_MS_ENV)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.flush_interval),
            failure_policy,
            loki,
            #[cfg(feature = "kafka")]
            kafka,
            log_level: lookup(LOG_LEVEL_ENV)
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or(defaults.log_level),
        };
        Ok(config.normalized())
    }

    /// Raise degenerate values to their minimums: a batch size of at
    /// least 1, a flush interval of at least 10ms, a request timeout of at
    /// least 100ms and, when requeueing, two attempts per record and room
    /// for one full batch.
    pub fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.flush_interval = self.flush_interval.max(MIN_FLUSH_INTERVAL);
        self.loki.timeout = self.loki.timeout.max(MIN_REQUEST_TIMEOUT);
        if let FailurePolicy::Requeue(limits) = &mut self.failure_policy {
            limits.max_attempts = limits.max_attempts.max(MIN_ATTEMPTS);
            limits.max_buffered = limits.max_buffered.max(self.batch_size);
        }
        self
    }
}

fn parse_opt<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `app=api-server,level=info` into a label map.
fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut labels = BTreeMap::new();
    for pair in split_list(raw) {
        match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                labels.insert(k.trim().to_string(), v.trim().to_string());
            }
            _ => {
                return Err(ConfigError::Invalid {
                    key: LOKI_LABELS_ENV,
                    value: raw.to_string(),
                    reason: format!("label {pair:?} is not key=value"),
                })
            }
        }
    }
    if labels.is_empty() {
        return Err(ConfigError::Invalid {
            key: LOKI_LABELS_ENV,
            value: raw.to_string(),
            reason: "a stream needs at least one label".to_string(),
        });
    }
    Ok(labels)
}
