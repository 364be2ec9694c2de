// stance_core/src/scaling.rs

//! Conversion between the unitless gains the optimizers see and physical gains.
//!
//! Every gain entry has its own positive scale factor so that `gain / scale`
//! sits roughly in `[0, 1]`. Both identifiers go through this module and nothing
//! else multiplies or divides by scale factors.

use crate::error::ConfigError;
use crate::types::{GainMatrix, NUM_GAINS};
use nalgebra::DVector;

/// Elementwise `gains / scale_factors`.
pub fn to_scaled(gains: &GainMatrix, scale_factors: &GainMatrix) -> GainMatrix {
    gains.component_div(scale_factors)
}

/// Elementwise `scaled_gains * scale_factors`.
pub fn to_physical(scaled_gains: &GainMatrix, scale_factors: &GainMatrix) -> GainMatrix {
    scaled_gains.component_mul(scale_factors)
}

pub fn validate_scale_factors(scale_factors: &GainMatrix) -> Result<(), ConfigError> {
    for row in 0..scale_factors.nrows() {
        for col in 0..scale_factors.ncols() {
            let value = scale_factors[(row, col)];
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NonPositiveScaleFactor { row, col, value });
            }
        }
    }
    Ok(())
}

/// Row-major flatten: `[k_00, k_01, k_02, k_03, k_10, k_11, k_12, k_13]`.
pub fn flatten_gains(gains: &GainMatrix) -> [f64; NUM_GAINS] {
    let mut flat = [0.0; NUM_GAINS];
    for (i, value) in flat.iter_mut().enumerate() {
        *value = gains[(i / 4, i % 4)];
    }
    flat
}

pub fn unflatten_gains(flat: &[f64]) -> Result<GainMatrix, ConfigError> {
    if flat.len() != NUM_GAINS {
        return Err(ConfigError::ShapeMismatch {
            what: "flattened gains",
            expected: (NUM_GAINS, 1),
            got: (flat.len(), 1),
        });
    }
    Ok(GainMatrix::from_row_slice(flat))
}

/// Takes the trailing eight scaled gains of a collocation solution and returns
/// them in physical units as a 2x4 matrix.
pub fn extract_gains(
    solution: &DVector<f64>,
    scale_factors: &GainMatrix,
) -> Result<GainMatrix, ConfigError> {
    if solution.len() < NUM_GAINS {
        return Err(ConfigError::DecisionVectorLength {
            expected: NUM_GAINS,
            got: solution.len(),
        });
    }
    let tail = solution.rows(solution.len() - NUM_GAINS, NUM_GAINS);
    let scaled = unflatten_gains(tail.as_slice())?;
    Ok(to_physical(&scaled, scale_factors))
}
