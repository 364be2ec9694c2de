// stance_core/src/error.rs

use thiserror::Error;

/// Problems with the inputs to a solve. These are raised before any solver runs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("at least {required} nodes are required, got {got}")]
    TooFewNodes { required: usize, got: usize },

    #[error("node interval must be positive and finite, got {0}")]
    NonPositiveInterval(f64),

    #[error("{what}: expected shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("decision vector must have length {expected}, got {got}")]
    DecisionVectorLength { expected: usize, got: usize },

    #[error("invalid bounds for '{symbol}': lower {lower} is above upper {upper}")]
    InvalidBounds {
        symbol: String,
        lower: f64,
        upper: f64,
    },

    #[error("gain scale factor at ({row}, {col}) must be strictly positive and finite, got {value}")]
    NonPositiveScaleFactor { row: usize, col: usize, value: f64 },

    #[error("unknown solver option '{0}'")]
    UnknownOption(String),

    #[error("invalid value for solver option '{key}': {reason}")]
    InvalidOptionValue { key: String, reason: String },

    #[error("sample grid must be strictly monotone: {0}")]
    NonMonotoneGrid(String),

    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),

    #[error("no known trajectory supplied for '{0}'")]
    MissingTrajectory(String),
}

/// A fixed-step integration produced NaN or infinity.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IntegrationError {
    #[error("integration produced a non-finite state at t = {time}")]
    NonFinite { time: f64 },
}

#[derive(Debug, Error)]
pub enum IdentificationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),

    #[error("least squares solve failed: {0}")]
    Singular(String),
}
