// stance_core/src/identification/shooting.rs

//! Gain identification by single shooting: simulate under candidate gains and
//! minimize the tracking error over gain space.

use nalgebra::DVector;
use serde::Deserialize;
use tracing::{info, trace, warn};

use crate::error::{ConfigError, IdentificationError, IntegrationError};
use crate::models::closed_loop::ClosedLoopOde;
use crate::optimize::{self, Method, MinimizeOptions, MinimizeResult};
use crate::scaling::{flatten_gains, to_physical, unflatten_gains};
use crate::types::{GainMatrix, State, StateTrajectory, NUM_STATES};
use crate::utils::integrators::IntegratorKind;

/// Objective value reported for candidates whose simulation diverges.
pub const DIVERGENCE_PENALTY: f64 = 1e20;

/// `interval * sum((measured - simulated)^2)`.
pub fn sum_of_squares(measured: &StateTrajectory, simulated: &StateTrajectory, interval: f64) -> f64 {
    interval * (measured - simulated).norm_squared()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ShootingOptions {
    pub integrator: IntegratorKind,
    /// Integrator steps per sample interval.
    pub substeps: usize,
    /// Propagate integration failures instead of penalizing them.
    pub strict: bool,
    pub max_evaluations: Option<usize>,
    pub max_iterations: Option<usize>,
    /// CMA-ES sampling seed.
    pub seed: u64,
}

impl Default for ShootingOptions {
    fn default() -> Self {
        Self {
            integrator: IntegratorKind::Rk4,
            substeps: 1,
            strict: false,
            max_evaluations: None,
            max_iterations: None,
            seed: 0,
        }
    }
}

/// Tracking error of the simulated closed loop as a function of scaled gains.
///
/// Holds its own copy of the closed-loop ODE. Gains are an argument of every
/// evaluation, so one objective can be shared across threads.
#[derive(Debug, Clone)]
pub struct ShootingObjective {
    ode: ClosedLoopOde,
    time: Vec<f64>,
    measured: StateTrajectory,
    initial_condition: State,
    scale_factors: GainMatrix,
    interval: f64,
    integrator: IntegratorKind,
    substeps: usize,
    strict: bool,
}

impl ShootingObjective {
    pub fn new(
        ode: &ClosedLoopOde,
        time: &DVector<f64>,
        measured_states: &StateTrajectory,
        options: &ShootingOptions,
    ) -> Result<Self, ConfigError> {
        if measured_states.shape() != (time.len(), NUM_STATES) {
            return Err(ConfigError::ShapeMismatch {
                what: "measured states",
                expected: (time.len(), NUM_STATES),
                got: measured_states.shape(),
            });
        }
        if options.substeps == 0 {
            return Err(ConfigError::InvalidOptionValue {
                key: "substeps".to_string(),
                reason: "expected at least one step per sample".to_string(),
            });
        }
        Ok(Self {
            ode: ode.clone(),
            time: time.as_slice().to_vec(),
            measured: measured_states.clone(),
            initial_condition: State::zeros(),
            scale_factors: ode.model().gain_scale_factors(),
            interval: 1.0,
            integrator: options.integrator,
            substeps: options.substeps,
            strict: options.strict,
        })
    }

    /// Weight applied to the sum of squares. Defaults to 1.
    pub fn with_interval(mut self, interval: f64) -> Self {
        self.interval = interval;
        self
    }

    /// Defaults to rest.
    pub fn with_initial_condition(mut self, x0: State) -> Self {
        self.initial_condition = x0;
        self
    }

    pub fn scale_factors(&self) -> GainMatrix {
        self.scale_factors
    }

    pub fn evaluate(&self, scaled_gains: &GainMatrix) -> Result<f64, IntegrationError> {
        let gains = to_physical(scaled_gains, &self.scale_factors);
        let integrator = self.integrator.integrator();
        let result = self
            .ode
            .simulate(
                &self.initial_condition,
                &self.time,
                &gains,
                integrator.as_ref(),
                self.substeps,
            )
            .map(|simulated| sum_of_squares(&self.measured, &simulated, self.interval))
            .and_then(|value| {
                if value.is_finite() {
                    Ok(value)
                } else {
                    Err(IntegrationError::NonFinite {
                        time: self.time.last().copied().unwrap_or_default(),
                    })
                }
            });

        match result {
            Err(error) if !self.strict => {
                trace!(%error, "penalizing divergent candidate");
                Ok(DIVERGENCE_PENALTY)
            }
            other => other,
        }
    }

    /// Evaluates a row-major flattened set of 8 scaled gains.
    pub fn evaluate_flat(&self, scaled_gains: &[f64]) -> Result<f64, IdentificationError> {
        let gains = unflatten_gains(scaled_gains)?;
        Ok(self.evaluate(&gains)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShootingOutcome {
    /// Physical gains.
    pub gains: GainMatrix,
    pub scaled_gains: GainMatrix,
    pub result: MinimizeResult,
}

/// Runs an outer optimizer over the scaled gains of a [`ShootingObjective`].
#[derive(Debug, Clone)]
pub struct ShootingIdentifier {
    objective: ShootingObjective,
    options: ShootingOptions,
}

impl ShootingIdentifier {
    pub fn new(
        time: &DVector<f64>,
        measured_states: &StateTrajectory,
        ode: &ClosedLoopOde,
        options: ShootingOptions,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            objective: ShootingObjective::new(ode, time, measured_states, &options)?,
            options,
        })
    }

    pub fn objective(&self) -> &ShootingObjective {
        &self.objective
    }

    /// `initial_guess` is in scaled units and defaults to zeros. CMA-ES starts
    /// with a step of 0.125 and evaluates each generation in parallel.
    pub fn identify(
        &self,
        method: Method,
        initial_guess: Option<&GainMatrix>,
        tolerance: f64,
    ) -> Result<(GainMatrix, ShootingOutcome), IdentificationError> {
        let x0 = DVector::from_row_slice(&flatten_gains(&initial_guess.copied().unwrap_or_default()));
        let minimize_options = MinimizeOptions {
            max_iterations: self.options.max_iterations,
            max_evaluations: self.options.max_evaluations,
            initial_step: 0.125,
            seed: self.options.seed,
        };
        let objective = &self.objective;
        let mut result = optimize::minimize(
            |x: &DVector<f64>| objective.evaluate_flat(x.as_slice()),
            &x0,
            method,
            tolerance,
            &minimize_options,
        )?;
        // A penalized best point means no candidate was ever simulated to the end;
        // the optimizer only saw a flat plateau.
        if result.fun >= DIVERGENCE_PENALTY {
            result.success = false;
            result.message = format!("every evaluated candidate diverged ({})", result.message);
        }

        if result.success {
            info!(
                ?method,
                nit = result.nit,
                nfev = result.nfev,
                fun = result.fun,
                "shooting identification converged: {}",
                result.message
            );
        } else {
            warn!(
                ?method,
                nit = result.nit,
                nfev = result.nfev,
                fun = result.fun,
                "shooting identification did not converge: {}",
                result.message
            );
        }

        let scaled_gains = unflatten_gains(result.x.as_slice())?;
        let gains = to_physical(&scaled_gains, &self.objective.scale_factors());
        Ok((
            gains,
            ShootingOutcome {
                gains,
                scaled_gains,
                result,
            },
        ))
    }
}

/// One-shot form of [`ShootingIdentifier::identify`].
pub fn identify(
    time: &DVector<f64>,
    measured_states: &StateTrajectory,
    ode: &ClosedLoopOde,
    method: Method,
    initial_guess: Option<&GainMatrix>,
    tolerance: f64,
    options: ShootingOptions,
) -> Result<(GainMatrix, ShootingOutcome), IdentificationError> {
    ShootingIdentifier::new(time, measured_states, ode, options)?.identify(method, initial_guess, tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identification::fixtures::{noiseless_experiment, SUBSTEPS};
    use crate::models::ClosedLoopModel;
    use crate::scaling::to_scaled;
    use approx::assert_abs_diff_eq;

    fn options() -> ShootingOptions {
        ShootingOptions {
            substeps: SUBSTEPS,
            ..ShootingOptions::default()
        }
    }

    #[test]
    fn objective_vanishes_at_the_true_gains() {
        let experiment = noiseless_experiment(101, 1.0);
        let objective =
            ShootingObjective::new(&experiment.ode, &experiment.time, &experiment.states, &options()).unwrap();
        let scaled = to_scaled(&experiment.model.gains(), &objective.scale_factors());
        assert_abs_diff_eq!(objective.evaluate(&scaled).unwrap(), 0.0, epsilon = 1e-20);
        assert!(objective.evaluate(&(scaled * 0.8)).unwrap() > 1e-8);
    }

    #[test]
    fn flat_and_matrix_gains_agree() {
        let experiment = noiseless_experiment(51, 0.5);
        let objective = ShootingObjective::new(&experiment.ode, &experiment.time, &experiment.states, &options())
            .unwrap()
            .with_interval(0.01);
        let scaled = GainMatrix::new(0.9, 0.2, 0.2, 0.05, 0.05, 0.3, 0.05, 0.02);
        assert_eq!(
            objective.evaluate(&scaled).unwrap(),
            objective.evaluate_flat(&flatten_gains(&scaled)).unwrap()
        );
        assert!(matches!(
            objective.evaluate_flat(&[0.1; 7]),
            Err(IdentificationError::Config(ConfigError::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn divergence_is_penalized_unless_strict() {
        let experiment = noiseless_experiment(101, 1.0);
        let unstable = GainMatrix::from_element(-1e3);

        let lenient =
            ShootingObjective::new(&experiment.ode, &experiment.time, &experiment.states, &options()).unwrap();
        assert_eq!(lenient.evaluate(&unstable).unwrap(), DIVERGENCE_PENALTY);

        let strict_options = ShootingOptions {
            strict: true,
            ..options()
        };
        let strict =
            ShootingObjective::new(&experiment.ode, &experiment.time, &experiment.states, &strict_options).unwrap();
        assert!(matches!(
            strict.evaluate(&unstable),
            Err(IntegrationError::NonFinite { .. })
        ));
    }

    fn max_relative_error(gains: &GainMatrix, actual: &GainMatrix) -> f64 {
        (gains - actual).component_div(actual).abs().max()
    }

    #[test]
    fn bfgs_from_the_true_gains_stays_there() {
        let experiment = noiseless_experiment(501, 5.0);
        let scaled = to_scaled(&experiment.model.gains(), &experiment.model.gain_scale_factors());
        let (gains, outcome) = identify(
            &experiment.time,
            &experiment.states,
            &experiment.ode,
            Method::Bfgs,
            Some(&scaled),
            1e-6,
            options(),
        )
        .unwrap();
        assert!(outcome.result.success, "{}", outcome.result.message);
        let error = max_relative_error(&gains, &experiment.model.gains());
        assert!(error < 0.02, "relative error {error}");
    }

    #[test]
    fn bfgs_from_zero_gains_claims_success_only_near_the_truth() {
        let experiment = noiseless_experiment(501, 5.0);
        let budget = ShootingOptions {
            max_iterations: Some(300),
            ..options()
        };
        let (gains, outcome) = identify(
            &experiment.time,
            &experiment.states,
            &experiment.ode,
            Method::Bfgs,
            None,
            1e-6,
            budget,
        )
        .unwrap();
        let error = max_relative_error(&gains, &experiment.model.gains());
        assert!(
            !outcome.result.success || error < 0.02,
            "reported success with relative error {error}: {}",
            outcome.result.message
        );
    }

    #[test]
    fn cma_recovers_the_gains_from_a_perturbed_guess() {
        let experiment = noiseless_experiment(501, 5.0);
        let scaled = to_scaled(&experiment.model.gains(), &experiment.model.gain_scale_factors()) * 0.7;
        let budget = ShootingOptions {
            max_evaluations: Some(20_000),
            ..options()
        };
        let (gains, outcome) = identify(
            &experiment.time,
            &experiment.states,
            &experiment.ode,
            Method::Cma,
            Some(&scaled),
            1e-12,
            budget,
        )
        .unwrap();
        assert!(outcome.result.success, "{}", outcome.result.message);
        let error = max_relative_error(&gains, &experiment.model.gains());
        assert!(error < 0.02, "relative error {error}");
    }

    #[test]
    fn a_divergent_start_is_never_reported_as_converged() {
        let experiment = noiseless_experiment(101, 1.0);
        let unstable = GainMatrix::from_element(-1.0);
        let identifier =
            ShootingIdentifier::new(&experiment.time, &experiment.states, &experiment.ode, options()).unwrap();
        for method in [Method::Bfgs, Method::NelderMead] {
            let (_, outcome) = identifier.identify(method, Some(&unstable), 1e-6).unwrap();
            assert_eq!(outcome.result.fun, DIVERGENCE_PENALTY, "{method:?}");
            assert!(!outcome.result.success, "{method:?}: {}", outcome.result.message);
            assert!(outcome.result.message.contains("diverged"), "{}", outcome.result.message);
        }
    }

    #[test]
    fn cma_respects_its_budget() {
        let experiment = noiseless_experiment(51, 0.5);
        let scaled = to_scaled(&experiment.model.gains(), &experiment.model.gain_scale_factors());
        let budget = ShootingOptions {
            max_evaluations: Some(40),
            seed: 11,
            ..options()
        };
        let identifier =
            ShootingIdentifier::new(&experiment.time, &experiment.states, &experiment.ode, budget).unwrap();
        let (gains, outcome) = identifier.identify(Method::Cma, Some(&scaled), 1e-12).unwrap();
        assert!(!outcome.result.success);
        assert!(outcome.result.nfev >= 40);
        assert!(outcome.result.fun.is_finite());
        assert_eq!(gains, to_physical(&outcome.scaled_gains, &experiment.model.gain_scale_factors()));
    }

    #[test]
    fn mismatched_measurements_are_rejected() {
        let experiment = noiseless_experiment(51, 0.5);
        let result = ShootingIdentifier::new(
            &experiment.time,
            &experiment.states.rows(0, 50).clone_owned(),
            &experiment.ode,
            options(),
        );
        assert!(matches!(result, Err(ConfigError::ShapeMismatch { .. })));
    }
}
