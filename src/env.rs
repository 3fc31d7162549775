//! Environment variable names read by [`crate::config::ShipperConfig::from_env`].
//!
//! These are purely helpers; the core types take explicit configuration
//! and never read the environment themselves.

/// Loki base HTTP URL, e.g. `http://loki:3100`.
pub const LOKI_URL_ENV: &str = "LOKI_URL";

/// Path prefix in front of `/push`, e.g. `loki/api/v1`.
pub const LOKI_API_PREFIX_ENV: &str = "LOKI_API_PREFIX";

/// Static stream labels as `key=value` pairs separated by commas.
pub const LOKI_LABELS_ENV: &str = "LOKI_LABELS";

/// Optional tenant sent as `X-Scope-OrgID`.
pub const LOKI_TENANT_ID_ENV: &str = "LOKI_TENANT_ID";

/// Push request timeout in milliseconds.
pub const LOKI_TIMEOUT_MS_ENV: &str = "LOKI_TIMEOUT_MS";

/// Number of buffered records that triggers a flush.
pub const BATCH_SIZE_ENV: &str = "SHIPPER_BATCH_SIZE";

/// Period of the flush timer in milliseconds.
pub const FLUSH_INTERVAL_MS_ENV: &str = "SHIPPER_FLUSH_INTERVAL_MS";

/// `requeue` or `discard`.
pub const FAILURE_POLICY_ENV: &str = "SHIPPER_FAILURE_POLICY";

/// Sends a record may take part in before it is dropped (requeue policy).
pub const MAX_ATTEMPTS_ENV: &str = "SHIPPER_MAX_ATTEMPTS";

/// Upper bound on buffered records after a requeue.
pub const MAX_BUFFERED_ENV: &str = "SHIPPER_MAX_BUFFERED";

/// Comma-separated Kafka bootstrap servers.
pub const KAFKA_BROKERS_ENV: &str = "KAFKA_BROKERS";

/// Kafka consumer group.
pub const KAFKA_GROUP_ID_ENV: &str = "KAFKA_GROUP_ID";

/// Kafka client id.
pub const KAFKA_CLIENT_ID_ENV: &str = "KAFKA_CLIENT_ID";

/// Comma-separated topics to subscribe to.
pub const KAFKA_TOPICS_ENV: &str = "KAFKA_TOPICS";

/// Log filter directive for the shipper's own logs.
pub const LOG_LEVEL_ENV: &str = "LOG_SHIPPER_LOG";

/// Read an environment variable, treating unset and empty the same.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
