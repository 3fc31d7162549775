use tracing::warn;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

const FALLBACK_FILTER: &str = "info";

/// Error returned when the global subscriber cannot be installed.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

/// Install the global `tracing` subscriber for the shipper's own logs.
///
/// **Parameters**
/// - `level`: an `EnvFilter` directive such as `info` or
///   `log_shipper=debug,warn`. An unparsable directive falls back to
///   `info`, and a warning naming it is logged once the subscriber is up.
///
/// **Effects**
///
/// Installs a [`Registry`] with a `fmt` layer writing to stdout, so all
/// `tracing` events in the process go through the filter.
pub fn init_logging(level: &str) -> Result<(), InitError> {
    let (filter, rejected) = build_filter(level);

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|_| InitError::AlreadyInstalled)?;

    if let Some(e) = rejected {
        warn!(directive = level, error = %e, "invalid log filter, falling back to info");
    }
    Ok(())
}

fn build_filter(level: &str) -> (EnvFilter, Option<ParseError>) {
    match EnvFilter::try_new(level) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(FALLBACK_FILTER), Some(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_directive_is_kept() {
        let (filter, rejected) = build_filter("log_shipper=debug,warn");
        assert!(rejected.is_none());
        assert!(filter.to_string().contains("log_shipper=debug"));
    }

    #[test]
    fn invalid_directive_is_reported_and_replaced() {
        let (filter, rejected) = build_filter("log_shipper=loud");
        assert!(rejected.is_some());
        assert!(filter.to_string().contains("info"));
        assert!(!filter.to_string().contains("log_shipper"));
    }
}
