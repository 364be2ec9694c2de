// stance_core/src/optimize/mod.rs

//! Unconstrained minimizers used by the shooting identifier.

use nalgebra::DVector;
use serde::Deserialize;

pub mod bfgs;
pub mod cma;
pub mod nelder_mead;

/// Which outer optimizer to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// CMA-ES with parallel population evaluation.
    #[default]
    Cma,
    Bfgs,
    NelderMead,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinimizeOptions {
    /// Iteration cap; `None` picks the method's own default.
    pub max_iterations: Option<usize>,
    pub max_evaluations: Option<usize>,
    /// CMA-ES initial step size.
    pub initial_step: f64,
    /// CMA-ES sampling seed.
    pub seed: u64,
}

impl Default for MinimizeOptions {
    fn default() -> Self {
        Self {
            max_iterations: None,
            max_evaluations: None,
            initial_step: 0.125,
            seed: 0,
        }
    }
}

/// Outcome of a minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct MinimizeResult {
    pub x: DVector<f64>,
    pub fun: f64,
    pub success: bool,
    pub message: String,
    /// Iterations (generations for CMA-ES).
    pub nit: usize,
    /// Objective evaluations.
    pub nfev: usize,
}

/// Minimizes `f` from `x0`. `tol` is the method's convergence tolerance
/// (gtol for BFGS, fatol/xatol for Nelder-Mead, tolfun for CMA-ES).
///
/// An `Err` from `f` aborts the run and is returned as is. Failing to converge
/// is not an error: it is reported through [`MinimizeResult::success`].
pub fn minimize<F, E>(
    f: F,
    x0: &DVector<f64>,
    method: Method,
    tol: f64,
    options: &MinimizeOptions,
) -> Result<MinimizeResult, E>
where
    F: Fn(&DVector<f64>) -> Result<f64, E> + Sync,
    E: Send,
{
    match method {
        Method::Bfgs => bfgs::minimize(f, x0, tol, options),
        Method::NelderMead => nelder_mead::minimize(f, x0, tol, options),
        Method::Cma => cma::minimize(f, x0, tol, options),
    }
}
