// stance_core/src/trajectory.rs

//! The gain-identification NLP: track the measured states subject to the closed-loop dynamics.

use nalgebra::DVector;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::ClosedLoopModel;
use crate::nlp::{
    CollocationSetup, DirectCollocation, GradientFn, IntegrationMethod, ObjectiveFn, OptionMap,
    OptionValue, SolveInfo,
};
use crate::types::{
    flatten_states, BoundsMap, GainMatrix, Signal, StateTrajectory, TrajectoryMap, NUM_STATES,
};

/// Box applied to every scaled gain.
///
/// This is a modeling choice, not a physical limit: a true gain whose scaled value
/// falls outside the box cannot be identified and shows up as a boundary-active gain.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GainBounds {
    pub lower: f64,
    pub upper: f64,
}

impl Default for GainBounds {
    fn default() -> Self {
        Self {
            lower: 0.0,
            upper: 1.0,
        }
    }
}

/// `dt * sum((measured - z[..4N])^2)` and its exact gradient.
fn tracking_objective(measured: DVector<f64>, interval: f64) -> (ObjectiveFn, GradientFn) {
    let reference = measured.clone();
    let objective: ObjectiveFn = Box::new(move |z: &DVector<f64>| {
        interval * (z.rows(0, reference.len()) - &reference).norm_squared()
    });
    let gradient: GradientFn = Box::new(move |z: &DVector<f64>| {
        let mut gradient = DVector::zeros(z.len());
        let n = measured.len();
        gradient
            .rows_mut(0, n)
            .copy_from(&((z.rows(0, n) - &measured) * (2.0 * interval)));
        gradient
    });
    (objective, gradient)
}

#[derive(Debug)]
pub struct TrajectoryProblem {
    collocation: DirectCollocation,
    measured_states: StateTrajectory,
    exogenous: Signal,
    gain_bounds: GainBounds,
    scale_factors: GainMatrix,
}

impl TrajectoryProblem {
    /// Midpoint collocation with the default `[0, 1]` gain box.
    pub fn build(
        num_nodes: usize,
        interval: f64,
        measured_states: &StateTrajectory,
        exogenous: &Signal,
        model: &(dyn ClosedLoopModel + 'static),
    ) -> Result<Self, ConfigError> {
        Self::build_with(
            num_nodes,
            interval,
            measured_states,
            exogenous,
            model,
            GainBounds::default(),
            IntegrationMethod::Midpoint,
        )
    }

    pub fn build_with(
        num_nodes: usize,
        interval: f64,
        measured_states: &StateTrajectory,
        exogenous: &Signal,
        model: &(dyn ClosedLoopModel + 'static),
        gain_bounds: GainBounds,
        method: IntegrationMethod,
    ) -> Result<Self, ConfigError> {
        check_measurements(num_nodes, measured_states, exogenous)?;

        let mut bounds = BoundsMap::new();
        for symbol in model.gain_symbols() {
            bounds.insert(symbol, (gain_bounds.lower, gain_bounds.upper));
        }
        let mut known_trajectories = TrajectoryMap::new();
        known_trajectories.insert(model.exogenous_symbol(), exogenous.clone());
        let (objective, gradient) = tracking_objective(flatten_states(measured_states), interval);

        let collocation = DirectCollocation::new(CollocationSetup {
            objective,
            gradient,
            model,
            state_symbols: model.state_symbols(),
            num_nodes,
            interval,
            known_parameters: model.known_parameters(),
            known_trajectories,
            bounds,
            time_symbol: model.time_symbol(),
            method,
        })?;

        Ok(Self {
            scale_factors: collocation.model().gain_scale_factors(),
            collocation,
            measured_states: measured_states.clone(),
            exogenous: exogenous.clone(),
            gain_bounds,
        })
    }

    /// Points the problem at new measurements. The decision layout, the bounds and the
    /// constraint structure stay as they are, only the objective and the exogenous input change.
    pub fn retarget(
        &mut self,
        measured_states: &StateTrajectory,
        exogenous: &Signal,
    ) -> Result<(), ConfigError> {
        check_measurements(self.num_nodes(), measured_states, exogenous)?;
        let symbol = self.collocation.model().exogenous_symbol();
        self.collocation.set_known_trajectory(&symbol, exogenous.clone())?;
        let (objective, gradient) = tracking_objective(flatten_states(measured_states), self.interval());
        self.collocation.set_objective(objective, gradient);
        self.measured_states = measured_states.clone();
        self.exogenous = exogenous.clone();
        Ok(())
    }

    pub fn objective(&self, z: &DVector<f64>) -> f64 {
        self.collocation.objective(z)
    }

    pub fn objective_gradient(&self, z: &DVector<f64>) -> DVector<f64> {
        self.collocation.objective_gradient(z)
    }

    pub fn constraints(&self, z: &DVector<f64>) -> DVector<f64> {
        self.collocation.constraints(z)
    }

    pub fn num_free(&self) -> usize {
        self.collocation.num_free()
    }

    pub fn num_nodes(&self) -> usize {
        self.collocation.num_nodes()
    }

    pub fn interval(&self) -> f64 {
        self.collocation.interval()
    }

    pub fn gain_bounds(&self) -> GainBounds {
        self.gain_bounds
    }

    pub fn scale_factors(&self) -> GainMatrix {
        self.scale_factors
    }

    pub fn measured_states(&self) -> &StateTrajectory {
        &self.measured_states
    }

    pub fn exogenous(&self) -> &Signal {
        &self.exogenous
    }

    pub fn collocation(&self) -> &DirectCollocation {
        &self.collocation
    }

    pub fn set_option(&mut self, key: &str, value: impl Into<OptionValue>) -> Result<(), ConfigError> {
        self.collocation.set_option(key, value)
    }

    pub fn apply_options(&mut self, options: &OptionMap) -> Result<(), ConfigError> {
        for (key, value) in options {
            self.collocation.set_option(key, value.clone())?;
        }
        Ok(())
    }

    pub fn solve(&self, initial_guess: &DVector<f64>) -> Result<(DVector<f64>, SolveInfo), ConfigError> {
        self.collocation.solve(initial_guess)
    }
}

fn check_measurements(
    num_nodes: usize,
    measured_states: &StateTrajectory,
    exogenous: &Signal,
) -> Result<(), ConfigError> {
    if num_nodes < 2 {
        return Err(ConfigError::TooFewNodes {
            required: 2,
            got: num_nodes,
        });
    }
    if measured_states.shape() != (num_nodes, NUM_STATES) {
        return Err(ConfigError::ShapeMismatch {
            what: "measured states",
            expected: (num_nodes, NUM_STATES),
            got: measured_states.shape(),
        });
    }
    if exogenous.len() != num_nodes {
        return Err(ConfigError::ShapeMismatch {
            what: "exogenous input",
            expected: (num_nodes, 1),
            got: (exogenous.len(), 1),
        });
    }
    Ok(())
}
