//! Tracing subscriber setup for hosts that do not install their own

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` wins over `config.level`. Returns `false` when a subscriber was
/// already installed, which is left in place.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match (config.format.as_str(), config.timestamps) {
        ("pretty", true) => builder.pretty().try_init(),
        ("pretty", false) => builder.pretty().without_time().try_init(),
        ("full", true) => builder.try_init(),
        ("full", false) => builder.without_time().try_init(),
        (_, true) => builder.compact().try_init(),
        (_, false) => builder.compact().without_time().try_init(),
    };

    installed.is_ok()
}
