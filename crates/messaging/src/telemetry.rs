use tracing_subscriber::EnvFilter;

use crate::config::ChatConfig;

/// Installs the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Returns false when a subscriber was already installed, so calling it twice is harmless.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Installs tracing with the configured `log_filter`.
pub fn init_from_config(config: &ChatConfig) -> bool {
    init_tracing(&config.log_filter)
}
