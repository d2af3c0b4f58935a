use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Role;
use crate::{MonitoringError, Result};

/// Installs the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise the crate logs at
/// `info`. Fails if a subscriber is already installed.
pub fn init_logger(role: Role) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("service_monitoring={}", Level::INFO)));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_level(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| MonitoringError::Internal(format!("Failed to initialize logger: {}", e)))?;

    tracing::info!(role = role.as_str(), version = env!("CARGO_PKG_VERSION"), "Logger initialized");
    Ok(())
}
