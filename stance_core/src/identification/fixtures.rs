// stance_core/src/identification/fixtures.rs

//! Noiseless closed-loop data shared by the identification tests.

use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;

use crate::models::closed_loop::ClosedLoopOde;
use crate::models::quiet_standing::QuietStandingModel;
use crate::models::ClosedLoopModel;
use crate::types::{linspace, State, StateTrajectory, NUM_STATES};
use crate::utils::integrators::RK4;

pub const SUBSTEPS: usize = 4;

pub struct Experiment {
    pub time: DVector<f64>,
    pub interval: f64,
    pub states: StateTrajectory,
    pub accel: DVector<f64>,
    pub model: QuietStandingModel,
    pub ode: ClosedLoopOde,
}

/// Sum-of-sines platform motion with fixed phases, 1 cm per component.
fn platform_acceleration(time: &DVector<f64>) -> DVector<f64> {
    let numbers = [7.0, 11.0, 16.0, 25.0, 38.0, 61.0, 103.0, 131.0, 151.0, 181.0, 313.0, 523.0];
    time.map(|t| {
        numbers
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let omega = 2.0 * PI * n / 240.0;
                let phase = -PI + 2.0 * PI * ((i as f64 * 0.618_034) % 1.0);
                -0.01 * omega * omega * (omega * t + phase).sin()
            })
            .sum()
    })
}

pub fn noiseless_experiment(num_nodes: usize, duration: f64) -> Experiment {
    let time = linspace(0.0, duration, num_nodes);
    let accel = platform_acceleration(&time);
    let model = QuietStandingModel::default();
    let ode = ClosedLoopOde::new(&model, &time, &DMatrix::zeros(num_nodes, 4), &accel)
        .expect("fixture signals are aligned");
    let states = ode
        .simulate(&State::zeros(), time.as_slice(), &model.gains(), &RK4, SUBSTEPS)
        .expect("closed loop stays finite");
    Experiment {
        interval: duration / (num_nodes - 1) as f64,
        time,
        states,
        accel,
        model,
        ode,
    }
}

/// Same platform motion, integrated with the implicit midpoint rule on the sample
/// grid. The midpoint collocation defects vanish exactly on these states at the
/// true gains.
pub fn midpoint_experiment(num_nodes: usize, duration: f64) -> Experiment {
    let mut experiment = noiseless_experiment(num_nodes, duration);
    let (model, accel) = (&experiment.model, &experiment.accel);
    let gains = model.gains();
    let interval = experiment.interval;

    let mut states = StateTrajectory::zeros(num_nodes, NUM_STATES);
    let mut x = State::zeros();
    for k in 0..num_nodes - 1 {
        let accel_mid = 0.5 * (accel[k] + accel[k + 1]);
        let mut next = x;
        for _ in 0..200 {
            let midpoint = 0.5 * (x + next);
            let update = x + interval * model.derivatives(&midpoint, &State::zeros(), accel_mid, &gains);
            let change = (update - next).amax();
            next = update;
            if change <= f64::EPSILON * next.amax() {
                break;
            }
        }
        x = next;
        states.set_row(k + 1, &x.transpose());
    }
    experiment.states = states;
    experiment
}
