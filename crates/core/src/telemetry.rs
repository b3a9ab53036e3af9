//! Tracing setup for embedding applications.
//!
//! The core never installs a subscriber on its own; hosts that want the
//! default console output call [`init`] once at startup.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Install the process-wide tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise from the configured
/// level. Fails if a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> crate::error::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| crate::error::NatterError::Internal(e.to_string()))?;

    tracing::debug!(level = %config.level, "telemetry initialized");
    Ok(())
}
