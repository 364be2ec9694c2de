// stance_sim/src/simulation/core/error.rs

use std::path::PathBuf;

use stance_core::error::{ConfigError, IdentificationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("failed to load scenario: {0}")]
    Figment(#[from] figment::Error),

    #[error("scenario not found at {0:?}")]
    MissingScenario(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identification(#[from] IdentificationError),

    #[error("invalid noise standard deviation for {what}: {std}")]
    InvalidNoise { what: &'static str, std: f64 },

    #[error("data generation needs at least 2 samples over a positive duration, got {num_samples} over {duration} s")]
    InvalidGrid { duration: f64, num_samples: usize },

    #[error("logging setup failed: {0}")]
    Logging(String),
}
