//! Tracing subscriber setup

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;

/// Build the filter: `RUST_LOG` when set, else the configured directive
pub fn env_filter(settings: &LoggingSettings) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    EnvFilter::try_new(&settings.filter)
        .map_err(|e| anyhow::anyhow!("invalid logging.filter `{}`: {}", settings.filter, e))
}

/// Install a global fmt subscriber
///
/// Returns `false` when a global subscriber was already installed (by the
/// host application or an earlier call), which is not an error.
pub fn init_tracing(settings: &LoggingSettings) -> Result<bool> {
    let filter = env_filter(settings)?;
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok();
    Ok(installed)
}
