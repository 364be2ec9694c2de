// stance_core/src/models/mod.rs

use dyn_clone::DynClone;
use nalgebra::{DMatrix, DVector, Matrix4};
use std::fmt::Debug;

use crate::error::ConfigError;
use crate::models::closed_loop::ClosedLoopOde;
use crate::types::{GainMatrix, ParameterMap, State, Symbol, NUM_GAINS, NUM_STATES};

pub mod closed_loop;
pub mod quiet_standing;

/// Partial derivatives of the implicit residual `f(x, x_dot, a, k) = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualJacobians {
    /// 4x4, `df/dx`.
    pub wrt_state: Matrix4<f64>,
    /// 4x4, `df/dx_dot`.
    pub wrt_state_derivative: Matrix4<f64>,
    /// 4x8, `df/dk` with the scaled gains flattened row-major.
    pub wrt_gains: DMatrix<f64>,
}

/// A closed-loop plant/controller pair whose gains are to be identified.
///
/// The model is exposed two ways. The collocation path consumes the implicit
/// first-order residual and its Jacobians. The shooting path consumes the
/// explicit right hand side `x_dot = f(x, r, a; K)`. Gains are always passed in
/// explicitly, so evaluating a model never mutates it.
pub trait ClosedLoopModel: DynClone + Debug + Send + Sync {
    /// Ordered state symbols. This order defines the decision vector layout.
    fn state_symbols(&self) -> Vec<Symbol>;

    /// Gain symbols, row-major over the gain matrix.
    fn gain_symbols(&self) -> Vec<Symbol>;

    /// The exogenous input channel (platform acceleration).
    fn exogenous_symbol(&self) -> Symbol;

    fn time_symbol(&self) -> Symbol {
        Symbol::new("t")
    }

    /// Named model constants, including the gain scale factors.
    fn known_parameters(&self) -> ParameterMap;

    /// Overwrites model constants from a map. Symbols the model does not own are rejected.
    fn apply_known_parameters(&mut self, parameters: &ParameterMap) -> Result<(), ConfigError>;

    /// The physical gains the model currently carries.
    fn gains(&self) -> GainMatrix;

    fn set_gains(&mut self, gains: GainMatrix);

    fn gain_scale_factors(&self) -> GainMatrix;

    /// Explicit closed-loop dynamics with physical gains and reference `r`:
    /// torques are `K (r - x)`.
    fn derivatives(&self, x: &State, reference: &State, accel: f64, gains: &GainMatrix) -> State;

    /// Implicit residual `f(x, x_dot, a, k)` with a zero reference and scaled gains `k`.
    /// It vanishes along trajectories of the closed-loop system.
    fn implicit_residual(
        &self,
        x: &State,
        x_dot: &State,
        accel: f64,
        scaled_gains: &GainMatrix,
    ) -> State;

    /// Jacobians of [`ClosedLoopModel::implicit_residual`]. Defaults to central differences.
    fn residual_jacobians(
        &self,
        x: &State,
        x_dot: &State,
        accel: f64,
        scaled_gains: &GainMatrix,
    ) -> ResidualJacobians {
        finite_difference_jacobians(self, x, x_dot, accel, scaled_gains)
    }
}

dyn_clone::clone_trait_object!(ClosedLoopModel);

impl dyn ClosedLoopModel {
    /// Binds this model to sampled reference noise (`N x 4`) and platform acceleration.
    pub fn closed_loop_ode(
        &self,
        time: &DVector<f64>,
        reference_noise: &DMatrix<f64>,
        accel: &DVector<f64>,
    ) -> Result<ClosedLoopOde, ConfigError> {
        ClosedLoopOde::new(self, time, reference_noise, accel)
    }
}

/// Central-difference Jacobians of the implicit residual.
pub fn finite_difference_jacobians<M: ClosedLoopModel + ?Sized>(
    model: &M,
    x: &State,
    x_dot: &State,
    accel: f64,
    scaled_gains: &GainMatrix,
) -> ResidualJacobians {
    let epsilon = 1e-6;
    let mut wrt_state = Matrix4::zeros();
    let mut wrt_state_derivative = Matrix4::zeros();
    let mut wrt_gains = DMatrix::zeros(NUM_STATES, NUM_GAINS);

    for j in 0..NUM_STATES {
        let (mut plus, mut minus) = (*x, *x);
        plus[j] += epsilon;
        minus[j] -= epsilon;
        let column = (model.implicit_residual(&plus, x_dot, accel, scaled_gains)
            - model.implicit_residual(&minus, x_dot, accel, scaled_gains))
            / (2.0 * epsilon);
        wrt_state.set_column(j, &column);

        let (mut plus, mut minus) = (*x_dot, *x_dot);
        plus[j] += epsilon;
        minus[j] -= epsilon;
        let column = (model.implicit_residual(x, &plus, accel, scaled_gains)
            - model.implicit_residual(x, &minus, accel, scaled_gains))
            / (2.0 * epsilon);
        wrt_state_derivative.set_column(j, &column);
    }

    for j in 0..NUM_GAINS {
        let (mut plus, mut minus) = (*scaled_gains, *scaled_gains);
        plus[(j / 4, j % 4)] += epsilon;
        minus[(j / 4, j % 4)] -= epsilon;
        let column = (model.implicit_residual(x, x_dot, accel, &plus)
            - model.implicit_residual(x, x_dot, accel, &minus))
            / (2.0 * epsilon);
        wrt_gains.set_column(j, &column);
    }

    ResidualJacobians {
        wrt_state,
        wrt_state_derivative,
        wrt_gains,
    }
}
