// stance_core/src/types.rs

use nalgebra::{DMatrix, DVector, Matrix2x4, Vector4};
use std::collections::BTreeMap;
use std::fmt;

// --- Core Type Aliases ---
/// `[theta_a, theta_h, omega_a, omega_h]`: ankle and hip angles, then their rates.
pub type State = Vector4<f64>;
/// 2x4 feedback matrix. Row 0 drives the ankle torque, row 1 the hip torque.
pub type GainMatrix = Matrix2x4<f64>;
/// Sampled state trajectory, one row per sample and one column per state.
pub type StateTrajectory = DMatrix<f64>;
/// A sampled scalar signal such as the platform acceleration.
pub type Signal = DVector<f64>;

pub const NUM_STATES: usize = 4;
pub const NUM_GAINS: usize = 8;

// --- Symbols ---
/// The name of a model quantity: a state, a constant, a gain or an input channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

pub type ParameterMap = BTreeMap<Symbol, f64>;
pub type TrajectoryMap = BTreeMap<Symbol, Signal>;
pub type BoundsMap = BTreeMap<Symbol, (f64, f64)>;

// --- Trajectory Layout Helpers ---

/// Flattens an `N x 4` trajectory into `[x0(0..N), x1(0..N), x2(0..N), x3(0..N)]`.
///
/// nalgebra stores matrices column-major, so this is a straight copy.
pub fn flatten_states(states: &StateTrajectory) -> DVector<f64> {
    DVector::from_column_slice(states.as_slice())
}

/// Inverse of [`flatten_states`].
pub fn unflatten_states(flat: &[f64], num_nodes: usize) -> StateTrajectory {
    DMatrix::from_column_slice(num_nodes, flat.len() / num_nodes.max(1), flat)
}

/// Uniform grid `[0, duration]` with `num_samples` points.
pub fn linspace(start: f64, stop: f64, num_samples: usize) -> DVector<f64> {
    if num_samples < 2 {
        return DVector::from_element(num_samples, start);
    }
    let step = (stop - start) / (num_samples - 1) as f64;
    DVector::from_fn(num_samples, |i, _| start + step * i as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn flattening_groups_samples_by_state() {
        let states = DMatrix::from_fn(3, 4, |i, j| (10 * j + i) as f64);
        let flat = flatten_states(&states);
        assert_eq!(
            flat.as_slice(),
            &[0.0, 1.0, 2.0, 10.0, 11.0, 12.0, 20.0, 21.0, 22.0, 30.0, 31.0, 32.0]
        );
        assert_eq!(unflatten_states(flat.as_slice(), 3), states);
    }

    #[test]
    fn linspace_hits_both_ends() {
        let t = linspace(0.0, 5.0, 501);
        assert_eq!(t.len(), 501);
        assert_abs_diff_eq!(t[0], 0.0);
        assert_abs_diff_eq!(t[500], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(t[1] - t[0], 0.01, epsilon = 1e-12);
    }

    #[test]
    fn symbols_order_by_name() {
        let mut symbols = vec![Symbol::new("k_10"), Symbol::new("k_02"), Symbol::new("k_00")];
        symbols.sort();
        let names: Vec<&str> = symbols.iter().map(Symbol::name).collect();
        assert_eq!(names, vec!["k_00", "k_02", "k_10"]);
    }
}
