// stance_sim/src/simulation/core/logging.rs

use tracing_subscriber::EnvFilter;

use super::error::SimError;

/// Installs the global fmt subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) -> Result<(), SimError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| SimError::Logging(e.to_string()))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| SimError::Logging(e.to_string()))
}
