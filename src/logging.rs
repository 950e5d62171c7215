//! Logging setup on tracing-subscriber
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies, with
//! HTTP client internals held at `warn`.

use crate::error::ConfigError;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;

/// Build the filter from the base level plus noisy-crate overrides.
pub fn build_env_filter(level: &str) -> Result<EnvFilter, ConfigError> {
    let mut directives = vec![level.to_string()];

    let noisy: &[(&str, &str)] = &[
        ("hyper", "warn"),
        ("reqwest", "warn"),
        ("h2", "warn"),
        ("rustls", "warn"),
    ];
    for (target, lvl) in noisy {
        directives.push(format!("{}={}", target, lvl));
    }

    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str).map_err(|e| ConfigError::Invalid {
        key: "LOG_LEVEL".to_string(),
        message: format!("invalid tracing filter '{}': {}", filter_str, e),
    })
}

/// Install the global subscriber. Calling it twice is harmless; the second
/// call leaves the first subscriber in place.
pub fn init_logging(level: &str) -> Result<(), ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_env_filter(level)?,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoUtc::rfc_3339())
        .with_target(true)
        .try_init();
    Ok(())
}
