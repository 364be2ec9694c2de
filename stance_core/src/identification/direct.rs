// stance_core/src/identification/direct.rs

use nalgebra::{DMatrix, DVector};

use crate::error::{ConfigError, IdentificationError};
use crate::types::{GainMatrix, StateTrajectory, NUM_STATES};

/// Least-squares diagnostics alongside the gains.
#[derive(Debug, Clone, PartialEq)]
pub struct LeastSquaresFit {
    pub gains: GainMatrix,
    /// Residual sum of squares per torque channel.
    pub residuals: DVector<f64>,
    pub rank: usize,
    pub singular_values: DVector<f64>,
}

/// Estimates `K` from measured torques and states by solving `(-X) K' = U`,
/// assuming the controller tracks the zero reference.
#[derive(Debug, Clone)]
pub struct DirectIdentifier {
    inputs: DMatrix<f64>,
    states: StateTrajectory,
}

impl DirectIdentifier {
    /// `inputs` is `N x 2` (ankle, hip torque), `states` is `N x 4`.
    pub fn new(inputs: DMatrix<f64>, states: StateTrajectory) -> Result<Self, ConfigError> {
        let n = states.nrows();
        if states.ncols() != NUM_STATES || n < NUM_STATES {
            return Err(ConfigError::ShapeMismatch {
                what: "direct identification states",
                expected: (n.max(NUM_STATES), NUM_STATES),
                got: states.shape(),
            });
        }
        if inputs.shape() != (n, 2) {
            return Err(ConfigError::ShapeMismatch {
                what: "direct identification inputs",
                expected: (n, 2),
                got: inputs.shape(),
            });
        }
        Ok(Self { inputs, states })
    }

    pub fn identify(&self) -> Result<GainMatrix, IdentificationError> {
        Ok(self.fit()?.gains)
    }

    pub fn fit(&self) -> Result<LeastSquaresFit, IdentificationError> {
        let design = -&self.states;
        let svd = design.clone().svd(true, true);
        let tolerance = f64::EPSILON * self.states.nrows() as f64 * svd.singular_values.max();
        let rank = svd.rank(tolerance);
        if rank < NUM_STATES {
            return Err(IdentificationError::Singular(format!(
                "state matrix has rank {rank}, need {NUM_STATES}"
            )));
        }
        let solution = svd
            .solve(&self.inputs, tolerance)
            .map_err(|e| IdentificationError::Singular(e.to_string()))?;

        let misfit = &design * &solution - &self.inputs;
        let residuals = DVector::from_fn(misfit.ncols(), |j, _| misfit.column(j).norm_squared());

        Ok(LeastSquaresFit {
            gains: GainMatrix::from_fn(|r, c| solution[(c, r)]),
            residuals,
            rank,
            singular_values: svd.singular_values.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn example_states(n: usize) -> StateTrajectory {
        DMatrix::from_fn(n, 4, |k, i| ((k as f64) * 0.37 * (i + 1) as f64).sin() / (i + 1) as f64)
    }

    fn torques(states: &StateTrajectory, gains: &GainMatrix) -> DMatrix<f64> {
        let transposed = DMatrix::from_fn(4, 2, |i, j| gains[(j, i)]);
        -(states * transposed)
    }

    #[test]
    fn exact_on_noiseless_data() {
        let gains = GainMatrix::new(950.0, 175.0, 185.0, 50.0, 45.0, 290.0, 60.0, 26.0);
        let states = example_states(200);
        let identifier = DirectIdentifier::new(torques(&states, &gains), states).unwrap();
        let fit = identifier.fit().unwrap();
        assert_relative_eq!(fit.gains, gains, max_relative = 1e-9);
        assert_eq!(fit.rank, 4);
        assert_abs_diff_eq!(fit.residuals.amax(), 0.0, epsilon = 1e-12);
        assert_eq!(fit.singular_values.len(), 4);
    }

    #[test]
    fn rank_deficient_states_are_reported() {
        let mut states = example_states(50);
        let first = states.column(0).clone_owned();
        states.set_column(3, &(first * 2.0));
        let identifier = DirectIdentifier::new(DMatrix::zeros(50, 2), states).unwrap();
        assert!(matches!(
            identifier.identify(),
            Err(IdentificationError::Singular(_))
        ));
    }

    #[test]
    fn rejects_misaligned_samples() {
        let result = DirectIdentifier::new(DMatrix::zeros(10, 2), example_states(11));
        assert!(matches!(result, Err(ConfigError::ShapeMismatch { .. })));
        let result = DirectIdentifier::new(DMatrix::zeros(10, 2), DMatrix::zeros(10, 3));
        assert!(result.is_err());
    }
}
