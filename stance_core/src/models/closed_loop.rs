// stance_core/src/models/closed_loop.rs

use nalgebra::{DMatrix, DVector};

use crate::error::{ConfigError, IntegrationError};
use crate::models::ClosedLoopModel;
use crate::types::{GainMatrix, State, StateTrajectory, NUM_STATES};
use crate::utils::integrators::{integrate_fixed_step, Integrator};
use crate::utils::interpolation::LinearInterpolator;

/// The closed-loop right hand side bound to sampled reference noise and
/// platform acceleration.
///
/// Both signals are linearly interpolated between samples, so the ODE can be
/// evaluated at any time inside the sampled window. The gains are an argument
/// of every evaluation and never stored here.
#[derive(Debug, Clone)]
pub struct ClosedLoopOde {
    model: Box<dyn ClosedLoopModel>,
    reference: Vec<LinearInterpolator>,
    accel: LinearInterpolator,
}

impl ClosedLoopOde {
    /// `reference_noise` is `N x 4`, `accel` has length `N`, both sampled on `time`.
    pub fn new(
        model: &(dyn ClosedLoopModel + 'static),
        time: &DVector<f64>,
        reference_noise: &DMatrix<f64>,
        accel: &DVector<f64>,
    ) -> Result<Self, ConfigError> {
        let n = time.len();
        if reference_noise.shape() != (n, NUM_STATES) {
            return Err(ConfigError::ShapeMismatch {
                what: "reference noise",
                expected: (n, NUM_STATES),
                got: reference_noise.shape(),
            });
        }
        let times = time.as_slice().to_vec();
        let reference = (0..NUM_STATES)
            .map(|j| {
                LinearInterpolator::new(times.clone(), reference_noise.column(j).iter().copied().collect())
            })
            .collect::<Result<Vec<_>, _>>()?;
        let accel = LinearInterpolator::new(times, accel.as_slice().to_vec())?;

        Ok(Self {
            model: dyn_clone::clone_box(model),
            reference,
            accel,
        })
    }

    pub fn model(&self) -> &dyn ClosedLoopModel {
        self.model.as_ref()
    }

    pub fn reference(&self, t: f64) -> State {
        State::from_fn(|i, _| self.reference[i].value(t))
    }

    pub fn platform_acceleration(&self, t: f64) -> f64 {
        self.accel.value(t)
    }

    /// `x_dot = f(x, t; K)` with physical gains.
    pub fn eval(&self, x: &State, t: f64, gains: &GainMatrix) -> State {
        self.model
            .derivatives(x, &self.reference(t), self.platform_acceleration(t), gains)
    }

    /// Integrates from `x0` and returns the `len(time) x 4` state trajectory.
    pub fn simulate(
        &self,
        x0: &State,
        time: &[f64],
        gains: &GainMatrix,
        integrator: &dyn Integrator<f64>,
        substeps: usize,
    ) -> Result<StateTrajectory, IntegrationError> {
        let func = |x: &DVector<f64>, t: f64| -> DVector<f64> {
            let state = State::from_column_slice(x.as_slice());
            DVector::from_column_slice(self.eval(&state, t, gains).as_slice())
        };
        let x0 = DVector::from_column_slice(x0.as_slice());
        let samples = integrate_fixed_step(integrator, &func, &x0, time, substeps)?;

        let mut trajectory = StateTrajectory::zeros(samples.len(), NUM_STATES);
        for (i, x) in samples.iter().enumerate() {
            trajectory.set_row(i, &x.transpose());
        }
        Ok(trajectory)
    }

    /// Control torques `K (r - x)` along a trajectory, one row per sample.
    pub fn torques(&self, time: &[f64], states: &StateTrajectory, gains: &GainMatrix) -> DMatrix<f64> {
        let mut torques = DMatrix::zeros(states.nrows(), 2);
        for (i, &t) in time.iter().enumerate().take(states.nrows()) {
            let x = State::from_iterator(states.row(i).iter().copied());
            let u = gains * (self.reference(t) - x);
            torques.set_row(i, &u.transpose());
        }
        torques
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::quiet_standing::QuietStandingModel;
    use crate::types::linspace;
    use crate::utils::integrators::RK4;
    use approx::assert_abs_diff_eq;

    fn quiet_ode(accel: DVector<f64>) -> (ClosedLoopOde, DVector<f64>) {
        let time = linspace(0.0, 2.0, accel.len());
        let model = QuietStandingModel::default();
        let noise = DMatrix::zeros(time.len(), 4);
        (ClosedLoopOde::new(&model, &time, &noise, &accel).unwrap(), time)
    }

    #[test]
    fn upright_rest_is_an_equilibrium() {
        let (ode, time) = quiet_ode(DVector::zeros(201));
        let gains = QuietStandingModel::default().gains();
        let trajectory = ode
            .simulate(&State::zeros(), time.as_slice(), &gains, &RK4, 2)
            .unwrap();
        assert_abs_diff_eq!(trajectory.amax(), 0.0);
    }

    #[test]
    fn platform_push_is_damped_out() {
        let mut accel = DVector::zeros(801);
        for i in 0..20 {
            accel[i] = 1.0;
        }
        let time = linspace(0.0, 8.0, 801);
        let model = QuietStandingModel::default();
        let ode = ClosedLoopOde::new(&model, &time, &DMatrix::zeros(801, 4), &accel).unwrap();
        let trajectory = ode
            .simulate(&State::zeros(), time.as_slice(), &model.gains(), &RK4, 4)
            .unwrap();
        let peak = trajectory.rows(0, 200).amax();
        let tail = trajectory.rows(700, 101).amax();
        assert!(peak > 1e-3, "the push should move the body, peak {peak}");
        assert!(tail < 0.05 * peak, "tail {tail} did not decay from peak {peak}");
    }

    #[test]
    fn torques_follow_the_control_law() {
        let (ode, time) = quiet_ode(DVector::zeros(11));
        let gains = GainMatrix::from_element(2.0);
        let states = DMatrix::from_element(11, 4, 0.5);
        let torques = ode.torques(time.as_slice(), &states, &gains);
        assert_abs_diff_eq!(torques[(3, 0)], -4.0);
        assert_abs_diff_eq!(torques[(3, 1)], -4.0);
    }

    #[test]
    fn rejects_misaligned_reference_noise() {
        let time = linspace(0.0, 1.0, 11);
        let model = QuietStandingModel::default();
        let result = ClosedLoopOde::new(&model, &time, &DMatrix::zeros(10, 4), &DVector::zeros(11));
        assert!(matches!(result, Err(ConfigError::ShapeMismatch { .. })));
    }
}
