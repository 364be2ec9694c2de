// stance_core/src/nlp/collocation.rs

use nalgebra::{DMatrix, DVector, Matrix4};
use rayon::prelude::*;
use serde::Deserialize;
use std::fmt;

use crate::error::ConfigError;
use crate::models::ClosedLoopModel;
use crate::nlp::augmented_lagrangian;
use crate::nlp::options::{OptionValue, SolverOptions};
use crate::nlp::status::SolveInfo;
use crate::types::{
    BoundsMap, GainMatrix, ParameterMap, Signal, State, Symbol, TrajectoryMap, NUM_STATES,
};

pub type ObjectiveFn = Box<dyn Fn(&DVector<f64>) -> f64 + Send + Sync>;
pub type GradientFn = Box<dyn Fn(&DVector<f64>) -> DVector<f64> + Send + Sync>;

/// One-step scheme used to turn the implicit residual into interval constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMethod {
    #[default]
    Midpoint,
    BackwardEuler,
}

/// Constraint value and Jacobian blocks of the interval `[k, k + 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalBlocks {
    pub residual: State,
    /// `dc_k / dx_k`
    pub wrt_left: Matrix4<f64>,
    /// `dc_k / dx_{k+1}`
    pub wrt_right: Matrix4<f64>,
    /// 4 x p, one column per free parameter.
    pub wrt_parameters: DMatrix<f64>,
}

/// Inputs needed to pose a collocation problem.
pub struct CollocationSetup<'a> {
    pub objective: ObjectiveFn,
    pub gradient: GradientFn,
    pub model: &'a (dyn ClosedLoopModel + 'static),
    /// Must name the model's states in the model's order.
    pub state_symbols: Vec<Symbol>,
    pub num_nodes: usize,
    pub interval: f64,
    pub known_parameters: ParameterMap,
    /// Must map the model's exogenous symbol to one value per node.
    pub known_trajectories: TrajectoryMap,
    /// Keys are state or gain symbols. Anything not listed is unbounded.
    pub bounds: BoundsMap,
    pub time_symbol: Symbol,
    pub method: IntegrationMethod,
}

/// A direct collocation NLP over states at every node plus the free model parameters.
///
/// Decision vector layout: `[x_0(0..N), x_1(0..N), x_2(0..N), x_3(0..N), p_0..p_{P-1}]`,
/// where the free parameters are the model's gain symbols in sorted order.
pub struct DirectCollocation {
    objective: ObjectiveFn,
    gradient: GradientFn,
    model: Box<dyn ClosedLoopModel>,
    state_symbols: Vec<Symbol>,
    parameter_symbols: Vec<Symbol>,
    /// Position of each free parameter in the model's row-major gain order.
    parameter_gain_index: Vec<usize>,
    num_nodes: usize,
    interval: f64,
    exogenous_symbol: Symbol,
    exogenous: Signal,
    bounds: BoundsMap,
    time_symbol: Symbol,
    method: IntegrationMethod,
    lower: DVector<f64>,
    upper: DVector<f64>,
    options: SolverOptions,
}

impl fmt::Debug for DirectCollocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectCollocation")
            .field("model", &self.model)
            .field("num_nodes", &self.num_nodes)
            .field("interval", &self.interval)
            .field("method", &self.method)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl DirectCollocation {
    pub fn new(setup: CollocationSetup<'_>) -> Result<Self, ConfigError> {
        let CollocationSetup {
            objective,
            gradient,
            model,
            state_symbols,
            num_nodes,
            interval,
            known_parameters,
            known_trajectories,
            bounds,
            time_symbol,
            method,
        } = setup;

        if num_nodes < 2 {
            return Err(ConfigError::TooFewNodes {
                required: 2,
                got: num_nodes,
            });
        }
        if !(interval.is_finite() && interval > 0.0) {
            return Err(ConfigError::NonPositiveInterval(interval));
        }

        let model_states = model.state_symbols();
        if state_symbols.len() != model_states.len() {
            return Err(ConfigError::ShapeMismatch {
                what: "state symbols",
                expected: (model_states.len(), 1),
                got: (state_symbols.len(), 1),
            });
        }
        if let Some((given, _)) = state_symbols
            .iter()
            .zip(&model_states)
            .find(|(given, owned)| given != owned)
        {
            return Err(ConfigError::UnknownSymbol(given.to_string()));
        }
        if time_symbol != model.time_symbol() {
            return Err(ConfigError::UnknownSymbol(time_symbol.to_string()));
        }

        let mut model = dyn_clone::clone_box(model);
        model.apply_known_parameters(&known_parameters)?;

        let exogenous_symbol = model.exogenous_symbol();
        for (symbol, values) in &known_trajectories {
            if *symbol != exogenous_symbol {
                return Err(ConfigError::UnknownSymbol(symbol.to_string()));
            }
            check_trajectory_length(values, num_nodes)?;
        }
        let exogenous = known_trajectories
            .get(&exogenous_symbol)
            .cloned()
            .ok_or_else(|| ConfigError::MissingTrajectory(exogenous_symbol.to_string()))?;

        let gain_symbols = model.gain_symbols();
        let mut parameter_gain_index: Vec<usize> = (0..gain_symbols.len()).collect();
        parameter_gain_index.sort_by(|&a, &b| gain_symbols[a].cmp(&gain_symbols[b]));
        let parameter_symbols: Vec<Symbol> = parameter_gain_index
            .iter()
            .map(|&i| gain_symbols[i].clone())
            .collect();

        let num_free = NUM_STATES * num_nodes + parameter_symbols.len();
        let mut lower = DVector::from_element(num_free, f64::NEG_INFINITY);
        let mut upper = DVector::from_element(num_free, f64::INFINITY);
        for (symbol, &(lo, hi)) in &bounds {
            if lo.is_nan() || hi.is_nan() || lo > hi {
                return Err(ConfigError::InvalidBounds {
                    symbol: symbol.to_string(),
                    lower: lo,
                    upper: hi,
                });
            }
            if let Some(i) = state_symbols.iter().position(|s| s == symbol) {
                lower.rows_mut(i * num_nodes, num_nodes).fill(lo);
                upper.rows_mut(i * num_nodes, num_nodes).fill(hi);
            } else if let Some(q) = parameter_symbols.iter().position(|s| s == symbol) {
                lower[NUM_STATES * num_nodes + q] = lo;
                upper[NUM_STATES * num_nodes + q] = hi;
            } else {
                return Err(ConfigError::UnknownSymbol(symbol.to_string()));
            }
        }

        Ok(Self {
            objective,
            gradient,
            model,
            state_symbols,
            parameter_symbols,
            parameter_gain_index,
            num_nodes,
            interval,
            exogenous_symbol,
            exogenous,
            bounds,
            time_symbol,
            method,
            lower,
            upper,
            options: SolverOptions::default(),
        })
    }

    // --- Layout ---

    pub fn num_states(&self) -> usize {
        NUM_STATES
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn num_parameters(&self) -> usize {
        self.parameter_symbols.len()
    }

    pub fn num_free(&self) -> usize {
        NUM_STATES * self.num_nodes + self.num_parameters()
    }

    pub fn num_constraints(&self) -> usize {
        NUM_STATES * (self.num_nodes - 1)
    }

    pub fn state_symbols(&self) -> &[Symbol] {
        &self.state_symbols
    }

    pub fn parameter_symbols(&self) -> &[Symbol] {
        &self.parameter_symbols
    }

    pub fn time_symbol(&self) -> &Symbol {
        &self.time_symbol
    }

    pub fn method(&self) -> IntegrationMethod {
        self.method
    }

    pub fn model(&self) -> &dyn ClosedLoopModel {
        self.model.as_ref()
    }

    pub fn bounds_map(&self) -> &BoundsMap {
        &self.bounds
    }

    /// Per-entry lower and upper bounds in decision-vector order.
    pub fn bounds(&self) -> (&DVector<f64>, &DVector<f64>) {
        (&self.lower, &self.upper)
    }

    pub fn known_trajectories(&self) -> TrajectoryMap {
        TrajectoryMap::from([(self.exogenous_symbol.clone(), self.exogenous.clone())])
    }

    /// Index of state `i` at node `k` in the decision vector.
    pub fn state_index(&self, i: usize, k: usize) -> usize {
        i * self.num_nodes + k
    }

    /// Scaled gain matrix held in the parameter part of `z`.
    pub fn scaled_gains(&self, z: &DVector<f64>) -> GainMatrix {
        let offset = NUM_STATES * self.num_nodes;
        let mut gains = GainMatrix::zeros();
        for (q, &g) in self.parameter_gain_index.iter().enumerate() {
            gains[(g / 4, g % 4)] = z[offset + q];
        }
        gains
    }

    /// Writes scaled gains into the parameter part of `z`.
    pub fn set_scaled_gains(&self, z: &mut DVector<f64>, gains: &GainMatrix) {
        let offset = NUM_STATES * self.num_nodes;
        for (q, &g) in self.parameter_gain_index.iter().enumerate() {
            z[offset + q] = gains[(g / 4, g % 4)];
        }
    }

    // --- Options and mutation ---

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn set_option(&mut self, key: &str, value: impl Into<OptionValue>) -> Result<(), ConfigError> {
        self.options.set(key, value.into())
    }

    /// Replaces the objective. Layout and constraints are untouched.
    pub fn set_objective(&mut self, objective: ObjectiveFn, gradient: GradientFn) {
        self.objective = objective;
        self.gradient = gradient;
    }

    pub fn set_known_trajectory(&mut self, symbol: &Symbol, values: Signal) -> Result<(), ConfigError> {
        if *symbol != self.exogenous_symbol {
            return Err(ConfigError::UnknownSymbol(symbol.to_string()));
        }
        check_trajectory_length(&values, self.num_nodes)?;
        self.exogenous = values;
        Ok(())
    }

    // --- Evaluation ---

    pub fn objective(&self, z: &DVector<f64>) -> f64 {
        (self.objective)(z)
    }

    pub fn objective_gradient(&self, z: &DVector<f64>) -> DVector<f64> {
        (self.gradient)(z)
    }

    /// Diagonal curvature estimate from one gradient difference along the all-ones
    /// direction. Exact for separable quadratic objectives.
    pub fn objective_hessian_diagonal(&self, z: &DVector<f64>) -> DVector<f64> {
        let step = 1e-6;
        let shifted = z.add_scalar(step);
        let diagonal = (self.objective_gradient(&shifted) - self.objective_gradient(z)) / step;
        diagonal.map(|d| if d.is_finite() { d.max(0.0) } else { 0.0 })
    }

    fn node_state(&self, z: &DVector<f64>, k: usize) -> State {
        State::from_fn(|i, _| z[self.state_index(i, k)])
    }

    /// `(x, x_dot, a)` at which the residual of interval `k` is evaluated.
    fn collocation_point(&self, z: &DVector<f64>, k: usize) -> (State, State, f64) {
        let left = self.node_state(z, k);
        let right = self.node_state(z, k + 1);
        let x_dot = (right - left) / self.interval;
        match self.method {
            IntegrationMethod::Midpoint => (
                (left + right) * 0.5,
                x_dot,
                0.5 * (self.exogenous[k] + self.exogenous[k + 1]),
            ),
            IntegrationMethod::BackwardEuler => (right, x_dot, self.exogenous[k + 1]),
        }
    }

    /// Interval residuals stacked interval-major: entry `4k + i` is component `i` of interval `k`.
    pub fn constraints(&self, z: &DVector<f64>) -> DVector<f64> {
        let gains = self.scaled_gains(z);
        let residuals: Vec<State> = (0..self.num_nodes - 1)
            .into_par_iter()
            .map(|k| {
                let (x, x_dot, accel) = self.collocation_point(z, k);
                self.model.implicit_residual(&x, &x_dot, accel, &gains)
            })
            .collect();
        DVector::from_iterator(
            self.num_constraints(),
            residuals.iter().flat_map(|r| r.iter().copied()),
        )
    }

    pub fn constraint_jacobian_blocks(&self, z: &DVector<f64>) -> Vec<IntervalBlocks> {
        let gains = self.scaled_gains(z);
        let inv_dt = 1.0 / self.interval;
        (0..self.num_nodes - 1)
            .into_par_iter()
            .map(|k| {
                let (x, x_dot, accel) = self.collocation_point(z, k);
                let residual = self.model.implicit_residual(&x, &x_dot, accel, &gains);
                let jac = self.model.residual_jacobians(&x, &x_dot, accel, &gains);
                let rate = jac.wrt_state_derivative * inv_dt;
                let (wrt_left, wrt_right) = match self.method {
                    IntegrationMethod::Midpoint => {
                        (jac.wrt_state * 0.5 - rate, jac.wrt_state * 0.5 + rate)
                    }
                    IntegrationMethod::BackwardEuler => (-rate, jac.wrt_state + rate),
                };
                let wrt_parameters = DMatrix::from_fn(NUM_STATES, self.num_parameters(), |r, q| {
                    jac.wrt_gains[(r, self.parameter_gain_index[q])]
                });
                IntervalBlocks {
                    residual,
                    wrt_left,
                    wrt_right,
                    wrt_parameters,
                }
            })
            .collect()
    }

    /// Runs the engine from `initial_guess`. Only malformed input is an `Err`;
    /// non-convergence is reported through [`SolveInfo::status`].
    pub fn solve(&self, initial_guess: &DVector<f64>) -> Result<(DVector<f64>, SolveInfo), ConfigError> {
        if initial_guess.len() != self.num_free() {
            return Err(ConfigError::DecisionVectorLength {
                expected: self.num_free(),
                got: initial_guess.len(),
            });
        }
        Ok(augmented_lagrangian::solve(self, initial_guess))
    }
}

fn check_trajectory_length(values: &Signal, num_nodes: usize) -> Result<(), ConfigError> {
    if values.len() != num_nodes {
        return Err(ConfigError::ShapeMismatch {
            what: "known trajectory",
            expected: (num_nodes, 1),
            got: (values.len(), 1),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::quiet_standing::QuietStandingModel;
    use approx::assert_abs_diff_eq;

    fn setup(model: &QuietStandingModel, num_nodes: usize, method: IntegrationMethod) -> CollocationSetup<'_> {
        let mut known_trajectories = TrajectoryMap::new();
        known_trajectories.insert(
            model.exogenous_symbol(),
            DVector::from_fn(num_nodes, |k, _| 0.3 * (0.7 * k as f64).sin()),
        );
        CollocationSetup {
            objective: Box::new(|z: &DVector<f64>| z.norm_squared()),
            gradient: Box::new(|z: &DVector<f64>| 2.0 * z),
            model,
            state_symbols: model.state_symbols(),
            num_nodes,
            interval: 0.01,
            known_parameters: model.known_parameters(),
            known_trajectories,
            bounds: BoundsMap::new(),
            time_symbol: model.time_symbol(),
            method,
        }
    }

    fn sample_decision(problem: &DirectCollocation) -> DVector<f64> {
        DVector::from_fn(problem.num_free(), |i, _| 0.05 * ((i as f64) * 1.3).cos())
    }

    fn finite_difference_columns(problem: &DirectCollocation, z: &DVector<f64>) -> DMatrix<f64> {
        let eps = 1e-6;
        let mut jac = DMatrix::zeros(problem.num_constraints(), problem.num_free());
        for j in 0..problem.num_free() {
            let (mut plus, mut minus) = (z.clone(), z.clone());
            plus[j] += eps;
            minus[j] -= eps;
            let column = (problem.constraints(&plus) - problem.constraints(&minus)) / (2.0 * eps);
            jac.set_column(j, &column);
        }
        jac
    }

    fn assembled_jacobian(problem: &DirectCollocation, z: &DVector<f64>) -> DMatrix<f64> {
        let n = problem.num_nodes();
        let offset = NUM_STATES * n;
        let mut jac = DMatrix::zeros(problem.num_constraints(), problem.num_free());
        for (k, blocks) in problem.constraint_jacobian_blocks(z).iter().enumerate() {
            for r in 0..NUM_STATES {
                for i in 0..NUM_STATES {
                    jac[(4 * k + r, problem.state_index(i, k))] = blocks.wrt_left[(r, i)];
                    jac[(4 * k + r, problem.state_index(i, k + 1))] = blocks.wrt_right[(r, i)];
                }
                for q in 0..problem.num_parameters() {
                    jac[(4 * k + r, offset + q)] = blocks.wrt_parameters[(r, q)];
                }
            }
        }
        jac
    }

    #[test]
    fn decision_layout_matches_the_model() {
        let model = QuietStandingModel::default();
        let problem = DirectCollocation::new(setup(&model, 11, IntegrationMethod::Midpoint)).unwrap();
        assert_eq!(problem.num_free(), 4 * 11 + 8);
        assert_eq!(problem.num_constraints(), 4 * 10);
        assert_eq!(problem.parameter_symbols(), model.gain_symbols().as_slice());
        assert_eq!(problem.state_index(2, 3), 25);

        let mut z = DVector::zeros(problem.num_free());
        z[44 + 5] = 0.29;
        assert_abs_diff_eq!(problem.scaled_gains(&z)[(1, 1)], 0.29);
    }

    #[test]
    fn block_jacobians_match_finite_differences() {
        let model = QuietStandingModel::default();
        for method in [IntegrationMethod::Midpoint, IntegrationMethod::BackwardEuler] {
            let problem = DirectCollocation::new(setup(&model, 6, method)).unwrap();
            let z = sample_decision(&problem);
            let blocks = problem.constraint_jacobian_blocks(&z);
            let stacked = DVector::from_iterator(
                problem.num_constraints(),
                blocks.iter().flat_map(|b| b.residual.iter().copied()),
            );
            assert_abs_diff_eq!(stacked, problem.constraints(&z), epsilon = 1e-12);
            assert_abs_diff_eq!(
                assembled_jacobian(&problem, &z),
                finite_difference_columns(&problem, &z),
                epsilon = 1e-4
            );
        }
    }

    #[test]
    fn bounds_expand_over_nodes() {
        let model = QuietStandingModel::default();
        let mut input = setup(&model, 5, IntegrationMethod::Midpoint);
        input.bounds.insert("k_12".into(), (0.0, 1.0));
        input.bounds.insert("omega_a".into(), (-2.0, 2.0));
        let problem = DirectCollocation::new(input).unwrap();
        let (lower, upper) = problem.bounds();
        assert_eq!(lower[problem.state_index(2, 4)], -2.0);
        assert_eq!(upper[problem.state_index(2, 0)], 2.0);
        assert_eq!(lower[problem.state_index(1, 0)], f64::NEG_INFINITY);
        assert_eq!(upper[20 + 6], 1.0);
        assert_eq!(upper[20 + 7], f64::INFINITY);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let model = QuietStandingModel::default();

        let mut input = setup(&model, 5, IntegrationMethod::Midpoint);
        input.bounds.insert("k_00".into(), (1.0, 0.0));
        assert!(matches!(
            DirectCollocation::new(input),
            Err(ConfigError::InvalidBounds { .. })
        ));

        let mut input = setup(&model, 5, IntegrationMethod::Midpoint);
        input.bounds.insert("k_99".into(), (0.0, 1.0));
        assert_eq!(
            DirectCollocation::new(input).unwrap_err(),
            ConfigError::UnknownSymbol("k_99".into())
        );

        let mut input = setup(&model, 5, IntegrationMethod::Midpoint);
        input.known_trajectories.clear();
        assert!(matches!(
            DirectCollocation::new(input),
            Err(ConfigError::MissingTrajectory(_))
        ));

        let mut input = setup(&model, 5, IntegrationMethod::Midpoint);
        input.time_symbol = "tau".into();
        assert!(DirectCollocation::new(input).is_err());

        let mut input = setup(&model, 5, IntegrationMethod::Midpoint);
        input.state_symbols.swap(0, 1);
        assert!(DirectCollocation::new(input).is_err());

        let mut input = setup(&model, 5, IntegrationMethod::Midpoint);
        input.num_nodes = 1;
        assert!(matches!(
            DirectCollocation::new(input),
            Err(ConfigError::TooFewNodes { .. })
        ));

        let mut input = setup(&model, 5, IntegrationMethod::Midpoint);
        input.interval = 0.0;
        assert!(matches!(
            DirectCollocation::new(input),
            Err(ConfigError::NonPositiveInterval(_))
        ));
    }

    #[test]
    fn wrong_length_guess_is_a_configuration_error() {
        let model = QuietStandingModel::default();
        let problem = DirectCollocation::new(setup(&model, 5, IntegrationMethod::Midpoint)).unwrap();
        assert_eq!(
            problem.solve(&DVector::zeros(3)).unwrap_err(),
            ConfigError::DecisionVectorLength {
                expected: 28,
                got: 3
            }
        );
    }

    #[test]
    fn known_trajectory_can_be_replaced() {
        let model = QuietStandingModel::default();
        let mut problem = DirectCollocation::new(setup(&model, 5, IntegrationMethod::Midpoint)).unwrap();
        let symbol = model.exogenous_symbol();
        problem.set_known_trajectory(&symbol, DVector::from_element(5, 1.5)).unwrap();
        assert_eq!(problem.known_trajectories()[&symbol], DVector::from_element(5, 1.5));
        assert!(problem
            .set_known_trajectory(&symbol, DVector::zeros(4))
            .is_err());
        assert!(problem
            .set_known_trajectory(&"theta_a".into(), DVector::zeros(5))
            .is_err());
    }

    #[test]
    fn hessian_estimate_recovers_a_separable_quadratic() {
        let model = QuietStandingModel::default();
        let problem = DirectCollocation::new(setup(&model, 5, IntegrationMethod::Midpoint)).unwrap();
        let diagonal = problem.objective_hessian_diagonal(&sample_decision(&problem));
        assert_abs_diff_eq!(diagonal, DVector::from_element(28, 2.0), epsilon = 1e-6);
    }
}
