//! Logging setup using tracing.
//!
//! `RUST_LOG` takes precedence over the configured filter. JSON output is
//! meant for log aggregation; the default output is human-readable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the global tracing subscriber.
///
/// # Arguments
///
/// * `filter` - The log filter directive (e.g., "info,icf_framework=debug")
/// * `json` - Emit one JSON object per event
///
/// Returns an error if the filter does not parse or a subscriber is
/// already installed.
pub fn init_logging(filter: &str, json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter_layer = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(filter))?;

    if json {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .flatten_event(true);
        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(filter_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter_layer)
            .try_init()?;
    }

    tracing::info!(filter = %filter, json, "Logging initialized");
    Ok(())
}

/// Initialize logging from the framework's logging section.
pub fn init_from_config(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging(&config.filter, config.json)
}

/// Initialize logging for tests (with simpler output).
#[cfg(test)]
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_logging_does_not_panic() {
        init_test_logging();
        init_test_logging();
    }

    #[test]
    fn test_invalid_filter_is_reported() {
        if std::env::var("RUST_LOG").is_err() {
            assert!(init_logging("info,icf_framework=loudest", false).is_err());
        }
    }
}
